use crate::chunking::Chunk;
use crate::error::{AdvisorError, AdvisorResult};
use async_trait::async_trait;

/// Maps text to fixed-length vectors.
///
/// Implementations return exactly one vector per input, in input order, and
/// report provider failures as errors rather than substituting placeholder
/// vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> AdvisorResult<Vec<Vec<f32>>>;

    /// Embed a single string
    async fn embed_one(&self, text: &str) -> AdvisorResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AdvisorError::provider("provider returned no embedding"))
    }
}

/// Embed every chunk's text in one pass and assign the vectors back by index
pub async fn embed_chunks(embedder: &dyn Embedder, chunks: &mut [Chunk]) -> AdvisorResult<()> {
    if chunks.is_empty() {
        return Ok(());
    }

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;

    if vectors.len() != chunks.len() {
        return Err(AdvisorError::provider(format!(
            "expected {} embeddings, provider returned {}",
            chunks.len(),
            vectors.len()
        )));
    }

    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
        chunk.embedding = vector;
    }
    Ok(())
}
