use crate::embeddings::Embedder;
use crate::error::{AdvisorError, AdvisorResult};
use crate::rag::{AnswerStream, Completer, Prompt};
use crate::sse::SseDecoder;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::env;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.0-flash";

/// Gemini rejects batchEmbedContents requests above this size
const MAX_EMBED_BATCH: usize = 100;

/// Configuration for Gemini API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub embedding_model: String,
    pub chat_model: String,
    /// Timeout for each embedding request
    pub request_timeout: Duration,
    /// Timeout for a whole streamed completion
    pub stream_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        GeminiConfig {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            request_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(120),
        }
    }

    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let mut config = GeminiConfig::new(api_key);

        if let Ok(base) = env::var("GEMINI_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(model) = env::var("GEMINI_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(model) = env::var("GEMINI_CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Ok(secs) = env::var("GEMINI_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(
                secs.parse().context("GEMINI_TIMEOUT_SECS must be an integer")?,
            );
        }
        if let Ok(secs) = env::var("GEMINI_STREAM_TIMEOUT_SECS") {
            config.stream_timeout = Duration::from_secs(
                secs.parse()
                    .context("GEMINI_STREAM_TIMEOUT_SECS must be an integer")?,
            );
        }

        Ok(config)
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Gemini HTTP client")?;
        Ok(GeminiClient { config, client })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.config.api_base, model, method)
    }

    /// One `batchEmbedContents` call for at most `MAX_EMBED_BATCH` texts
    async fn embed_batch(&self, texts: &[String]) -> AdvisorResult<Vec<Vec<f32>>> {
        let model = format!("models/{}", self.config.embedding_model);
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: &model,
                    content: Content::text(text),
                })
                .collect(),
        };

        let url = self.model_url(&self.config.embedding_model, "batchEmbedContents");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(AdvisorError::provider)?;

        let response = ensure_success(response).await?;
        let response_data: BatchEmbedResponse =
            response.json().await.map_err(AdvisorError::provider)?;

        if response_data.embeddings.len() != texts.len() {
            return Err(AdvisorError::provider(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                response_data.embeddings.len()
            )));
        }

        Ok(response_data
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, texts: &[String]) -> AdvisorResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_EMBED_BATCH) {
            debug!("Embedding batch of {} texts", batch.len());
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Completer for GeminiClient {
    async fn stream_completion(&self, prompt: &Prompt) -> AdvisorResult<AnswerStream> {
        let request = GenerateRequest {
            system_instruction: Content::text(&prompt.system),
            contents: vec![Content::with_role(&prompt.user, "user")],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.config.chat_model, "streamGenerateContent")
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .timeout(self.config.stream_timeout)
            .json(&request)
            .send()
            .await
            .map_err(AdvisorError::provider)?;

        let response = ensure_success(response).await?;
        Ok(delta_stream(response))
    }
}

struct DeltaState {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<AdvisorResult<String>>,
    finished: bool,
}

/// Turn a streamed `alt=sse` response into text deltas
fn delta_stream(response: reqwest::Response) -> AnswerStream {
    let state = DeltaState {
        bytes: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                    state.finished = true;
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    for event in state.decoder.push(&bytes) {
                        queue_event_text(&mut state.pending, &event.data);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(AdvisorError::provider(e)), state));
                }
                None => {
                    state.finished = true;
                    if let Some(event) = state.decoder.finish() {
                        queue_event_text(&mut state.pending, &event.data);
                    }
                }
            }
        }
    })
    .boxed()
}

fn queue_event_text(pending: &mut VecDeque<AdvisorResult<String>>, data: &str) {
    match parse_stream_chunk(data) {
        Ok(Some(text)) => pending.push_back(Ok(text)),
        Ok(None) => {}
        Err(e) => pending.push_back(Err(e)),
    }
}

/// Extract the text carried by one streamed `GenerateContentResponse`
fn parse_stream_chunk(data: &str) -> AdvisorResult<Option<String>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AdvisorError::provider(format!("malformed stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(AdvisorError::provider(format!(
            "{} {}",
            error.code.unwrap_or_default(),
            error.message
        )));
    }

    let text: String = chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().map(|part| part.text).collect())
        .unwrap_or_default();

    Ok(if text.is_empty() { None } else { Some(text) })
}

async fn ensure_success(response: reqwest::Response) -> AdvisorResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(AdvisorError::provider(format!(
        "API request failed: {} {}",
        status, error_text
    )))
}

// Request/response structures for the Gemini API

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
}

impl<'a> Content<'a> {
    fn text(text: &'a str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: None,
        }
    }

    fn with_role(text: &'a str, role: &'static str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: Some(role),
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct EmbedContentRequest<'a> {
    model: &'a str,
    content: Content<'a>,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Deserialize, Debug)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::Matcher;

    fn test_client(server: &mockito::Server) -> GeminiClient {
        let mut config = GeminiConfig::new("test-key");
        config.api_base = server.url();
        GeminiClient::new(config).unwrap()
    }

    fn sse_body(deltas: &[&str]) -> String {
        deltas
            .iter()
            .map(|text| {
                let chunk = serde_json::json!({
                    "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
                });
                format!("data: {}\r\n\r\n", chunk)
            })
            .collect()
    }

    #[test]
    fn test_parse_stream_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(parse_stream_chunk(data).unwrap(), Some("Hello".to_string()));
        assert_eq!(
            parse_stream_chunk(r#"{"candidates":[{"finishReason":"STOP"}]}"#).unwrap(),
            None
        );
        assert!(parse_stream_chunk(r#"{"error":{"code":429,"message":"quota"}}"#).is_err());
        assert!(parse_stream_chunk("not json").is_err());
    }

    #[tokio::test]
    async fn test_batch_embeddings_in_input_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/text-embedding-004:batchEmbedContents")
            .match_header("x-goog-api-key", "test-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "requests": [
                    {"model": "models/text-embedding-004", "content": {"parts": [{"text": "math"}]}},
                    {"model": "models/text-embedding-004", "content": {"parts": [{"text": "physics"}]}}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embeddings":[{"values":[1.0,0.0]},{"values":[0.0,1.0]}]}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let vectors = client
            .embed(&["math".to_string(), "physics".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_empty_embedding_input_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let vectors = test_client(&server).embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_embedding_failure_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/models/text-embedding-004:batchEmbedContents")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let err = test_client(&server)
            .embed(&["math".to_string()])
            .await
            .unwrap_err();
        match err {
            AdvisorError::Provider(message) => assert!(message.contains("429")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_completion_yields_deltas() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/gemini-2.0-flash:streamGenerateContent")
            .match_query(Matcher::UrlEncoded("alt".into(), "sse".into()))
            .match_body(Matcher::PartialJson(serde_json::json!({
                "systemInstruction": {"parts": [{"text": "Be brief."}]},
                "contents": [{"role": "user", "parts": [{"text": "Question: hi"}]}]
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body(&["You need ", "3 credits", " of math."]))
            .create_async()
            .await;

        let prompt = Prompt {
            system: "Be brief.".to_string(),
            user: "Question: hi".to_string(),
        };
        let stream = test_client(&server).stream_completion(&prompt).await.unwrap();
        let deltas: Vec<String> = stream.try_collect().await.unwrap();

        mock.assert_async().await;
        assert_eq!(deltas, vec!["You need ", "3 credits", " of math."]);
    }

    #[tokio::test]
    async fn test_stream_error_event_ends_stream_with_error() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "{}data: {{\"error\":{{\"code\":500,\"message\":\"backend\"}}}}\n\n{}",
            sse_body(&["partial"]),
            sse_body(&["never seen"])
        );
        server
            .mock("POST", "/models/gemini-2.0-flash:streamGenerateContent")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let prompt = Prompt {
            system: String::new(),
            user: "q".to_string(),
        };
        let items: Vec<AdvisorResult<String>> = test_client(&server)
            .stream_completion(&prompt)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("partial".to_string()));
        assert!(matches!(items[1], Err(AdvisorError::Provider(_))));
    }

    #[tokio::test]
    async fn test_stream_rejected_request_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/models/gemini-2.0-flash:streamGenerateContent")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("API key not valid")
            .create_async()
            .await;

        let prompt = Prompt {
            system: String::new(),
            user: "q".to_string(),
        };
        let result = test_client(&server).stream_completion(&prompt).await;
        assert!(matches!(result, Err(AdvisorError::Provider(_))));
    }
}
