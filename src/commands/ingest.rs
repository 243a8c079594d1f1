//! `ingest`: load documents into the vector store

use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use crate::backends::{Chunk, VectorClient};

/// Documents sent per insert call
pub const INSERT_BATCH_SIZE: usize = 64;

/// Parse JSON lines into chunks.
///
/// Each non-blank line is either an object `{"content": ..., "metadata": {...}}`
/// or a bare JSON string.
pub fn parse_chunks(content: &str) -> anyhow::Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let chunk = if line.starts_with('"') {
            Chunk::new(serde_json::from_str::<String>(line)?)
        } else {
            serde_json::from_str::<Chunk>(line)
                .with_context(|| format!("Invalid chunk on line {}", line_no + 1))?
        };
        if chunk.content.trim().is_empty() {
            warn!(line = line_no + 1, "Skipping empty chunk");
            continue;
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Insert every chunk in `path`, returning the number stored
pub async fn run(vector: &VectorClient, path: &Path) -> anyhow::Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let chunks = parse_chunks(&content)?;
    info!(
        "Ingesting {} chunks into {}",
        chunks.len(),
        vector.collection_id()
    );

    let mut stored = 0;
    for batch in chunks.chunks(INSERT_BATCH_SIZE) {
        stored += vector.insert(batch).await?;
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objects_and_bare_strings() {
        let input = r#"
{"content": "Basel III overview", "metadata": {"doc": "reg-1"}}
"AML policy summary"

{"content": "   "}
"#;
        let chunks = parse_chunks(input).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata["doc"], "reg-1");
        assert_eq!(chunks[1].content, "AML policy summary");
    }

    #[test]
    fn reports_the_bad_line() {
        let err = parse_chunks("\"ok\"\n{not json}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
