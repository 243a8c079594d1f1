//! Tests for CLI commands

mod test_ask;
mod test_ingest;
mod test_query;
