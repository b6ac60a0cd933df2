use crate::embeddings::Embedder;
use crate::error::{AdvisorError, AdvisorResult};
use crate::ingest::IngestionCoordinator;
use crate::vector_store::ScoredChunk;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::{debug, info};
use serde_json::Value;
use std::io::{self, Write};
use std::sync::Arc;

pub const DEFAULT_TOP_K: usize = 6;

pub const SYSTEM_PROMPT: &str = "You are a campus academic advisor assistant. \
Answer only from the provided context. Cite the source URL for every fact you use. \
If the context does not contain the answer, say so instead of guessing. \
If the question depends on plan details that are missing (major, catalog year, \
completed courses, target graduation term), ask the student for them. \
Always remind the student to verify plans with an official academic advisor.";

/// Lazy, finite, non-restartable sequence of answer text deltas
pub type AnswerStream = BoxStream<'static, AdvisorResult<String>>;

/// A grounded prompt: fixed system instruction plus one user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Streaming text-generation provider
#[async_trait]
pub trait Completer: Send + Sync {
    async fn stream_completion(&self, prompt: &Prompt) -> AdvisorResult<AnswerStream>;
}

/// Concatenate retrieved chunks into the context block
pub fn build_context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|hit| format!("Source: {}\n{}", hit.chunk.source, hit.chunk.text))
        .collect::<Vec<String>>()
        .join("\n\n")
}

/// Assemble the system instruction and the grounded user message
pub fn build_prompt(question: &str, context: &str, student_context: Option<&Value>) -> Prompt {
    let student_context = student_context
        .map(Value::to_string)
        .unwrap_or_else(|| "{}".to_string());

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "Context:\n{}\n\nStudent context (JSON):\n{}\n\nQuestion: {}",
            context, student_context, question
        ),
    }
}

fn validate_question(question: &str) -> AdvisorResult<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AdvisorError::validation("question must not be blank"));
    }
    Ok(question)
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    coordinator: Arc<IngestionCoordinator>,
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn Completer>,
    top_k: usize,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
    ) -> Self {
        RagEngine {
            coordinator,
            embedder,
            completer,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.coordinator
    }

    /// Wait for ingestion, embed the question and fetch the nearest chunks
    pub async fn retrieve(&self, question: &str) -> AdvisorResult<Vec<ScoredChunk>> {
        let question = validate_question(question)?;

        self.coordinator.ensure_ready().await?;
        let query = self.embedder.embed_one(question).await?;
        let hits = self.coordinator.store().search(&query, self.top_k)?;

        debug!(
            "Retrieved {} chunks (best score {:?})",
            hits.len(),
            hits.first().map(|hit| hit.score)
        );
        Ok(hits)
    }

    /// Stream an answer grounded in the retrieved context.
    ///
    /// A blank question is rejected before any network call. Dropping the
    /// returned stream cancels the upstream request.
    pub async fn answer_stream(
        &self,
        question: &str,
        student_context: Option<&Value>,
    ) -> AdvisorResult<AnswerStream> {
        let question = validate_question(question)?;

        let hits = self.retrieve(question).await?;
        let context = build_context(&hits);
        let prompt = build_prompt(question, &context, student_context);

        self.completer.stream_completion(&prompt).await
    }

    /// Collect a full answer
    pub async fn answer(
        &self,
        question: &str,
        student_context: Option<&Value>,
    ) -> AdvisorResult<String> {
        let stream = self.answer_stream(question, student_context).await?;
        let deltas: Vec<String> = stream.try_collect().await?;
        Ok(deltas.concat())
    }

    /// Interactive terminal loop; answers are streamed to stdout as they arrive
    pub async fn run_query_loop(&self) -> anyhow::Result<()> {
        info!("Ready to answer questions. Type 'exit' to quit.");

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut buffer = String::new();

        loop {
            print!("\nYour question: ");
            stdout.flush()?;

            buffer.clear();
            if stdin.read_line(&mut buffer)? == 0 {
                break;
            }

            let question = buffer.trim();
            if question.eq_ignore_ascii_case("exit") {
                println!("Goodbye!");
                break;
            }
            if question.is_empty() {
                continue;
            }

            let mut stream = match self.answer_stream(question, None).await {
                Ok(stream) => stream,
                Err(err) => {
                    eprintln!("Error: {}", err);
                    continue;
                }
            };

            println!();
            while let Some(delta) = stream.next().await {
                match delta {
                    Ok(text) => {
                        print!("{}", text);
                        stdout.flush()?;
                    }
                    Err(err) => {
                        eprintln!("\nError: {}", err);
                        break;
                    }
                }
            }
            println!();
        }

        Ok(())
    }
}
