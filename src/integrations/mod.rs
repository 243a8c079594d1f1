//! External model integrations.

pub mod openai;

pub use openai::OpenAiEvaluator;
