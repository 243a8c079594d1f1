//! Embedding generation using OpenAI, for backends that search by vector

use anyhow::Result;
use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client as OpenAIClient,
};
use tracing::{debug, info};

/// Longest text sent to the embeddings endpoint, in bytes
const MAX_INPUT_BYTES: usize = 8000;

/// Service for generating text embeddings
pub struct EmbeddingService {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl EmbeddingService {
    /// `api_base` selects an OpenAI-compatible endpoint
    pub fn new(api_key: &str, api_base: &str, model: impl Into<String>) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("OPENAI_API_KEY not set");
        }
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Ok(Self {
            client: OpenAIClient::with_config(config),
            model: model.into(),
        })
    }

    /// Generate embedding for a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))
    }

    /// Generate embeddings for multiple texts in batch.
    /// Blank texts get empty vectors at their positions.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let processed: Vec<String> = texts
            .iter()
            .map(|t| truncate_to_boundary(t.trim(), MAX_INPUT_BYTES).to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if processed.is_empty() {
            return Ok(vec![Vec::new(); texts.len()]);
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(processed))
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        info!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        let mut result = Vec::with_capacity(texts.len());
        let mut embed_iter = response.data.into_iter();

        for text in texts {
            if text.trim().is_empty() {
                result.push(Vec::new());
            } else if let Some(embed) = embed_iter.next() {
                result.push(embed.embedding);
            }
        }

        Ok(result)
    }

    /// Get the embedding dimension for the current model
    pub fn dimension(&self) -> usize {
        match self.model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }
}

fn truncate_to_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
