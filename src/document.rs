use crate::error::{AdvisorError, AdvisorResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text_from_mem;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents a fetched source document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Raw text content; HTML markup is still present until chunking
    pub content: String,
    /// The source URL (used as document ID)
    pub document_id: String,
    /// The document's MIME type
    pub mime_type: String,
}

impl Document {
    /// Build a document from a response body and its declared content type
    pub fn from_bytes(url: &str, content_type: Option<&str>, body: &[u8]) -> AdvisorResult<Self> {
        let mime_type = match content_type {
            Some(declared) if !declared.trim().is_empty() => declared
                .split(';')
                .next()
                .unwrap_or(declared)
                .trim()
                .to_ascii_lowercase(),
            _ => guess_mime_type(url),
        };
        debug!("Detected MIME type {} for {}", mime_type, url);

        let content = read_document_content(url, &mime_type, body)?;

        Ok(Document {
            content,
            document_id: url.to_string(),
            mime_type,
        })
    }
}

/// Guess a MIME type from the path component of a URL
fn guess_mime_type(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or_default();
    from_path(path).first_or_octet_stream().to_string()
}

/// Decode a body according to its MIME type
fn read_document_content(url: &str, mime_type: &str, body: &[u8]) -> AdvisorResult<String> {
    match mime_type {
        mime if mime.starts_with("application/pdf") => {
            info!("Extracting text from PDF source: {}", url);
            let content = extract_text_from_mem(body)
                .map_err(|e| AdvisorError::source_fetch(url, format!("PDF extraction: {}", e)))?;
            if content.trim().is_empty() {
                warn!("Extracted PDF content is empty for {}", url);
            }
            Ok(content)
        }

        mime if mime.starts_with("text/")
            || mime.ends_with("json")
            || mime.ends_with("xml")
            || mime == "application/octet-stream" =>
        {
            String::from_utf8(body.to_vec())
                .map_err(|_| AdvisorError::source_fetch(url, "body is not valid UTF-8"))
        }

        _ => Err(AdvisorError::source_fetch(
            url,
            format!("unsupported document format: {}", mime_type),
        )),
    }
}

/// HTTP fetch capability used by ingestion
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AdvisorResult<Document>;
}

/// Fetches source documents over HTTP with a bounded timeout
#[derive(Clone)]
pub struct HttpSourceFetcher {
    client: reqwest::Client,
}

impl HttpSourceFetcher {
    pub fn new(timeout: Duration) -> AdvisorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("campus-advisor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AdvisorError::Ingestion(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpSourceFetcher { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str) -> AdvisorResult<Document> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AdvisorError::source_fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdvisorError::source_fetch(url, format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| AdvisorError::source_fetch(url, e))?;

        Document::from_bytes(url, content_type.as_deref(), &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_content_type_wins() {
        let doc = Document::from_bytes(
            "https://example.edu/catalog.pdf",
            Some("text/html; charset=utf-8"),
            b"<p>Course X</p>",
        )
        .unwrap();
        assert_eq!(doc.mime_type, "text/html");
        assert_eq!(doc.content, "<p>Course X</p>");
        assert_eq!(doc.document_id, "https://example.edu/catalog.pdf");
    }

    #[test]
    fn test_mime_type_guessed_from_url_path() {
        let doc =
            Document::from_bytes("https://example.edu/notes.txt?v=2", None, b"plain").unwrap();
        assert_eq!(doc.mime_type, "text/plain");
    }

    #[test]
    fn test_unsupported_binary_format_is_rejected() {
        let err =
            Document::from_bytes("https://example.edu/logo.png", Some("image/png"), b"\x89PNG")
                .unwrap_err();
        assert!(matches!(err, AdvisorError::SourceFetch { .. }));
    }

    #[tokio::test]
    async fn test_http_fetch_reads_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advising.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<h1>Advising</h1>")
            .create_async()
            .await;

        let fetcher = HttpSourceFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        let url = format!("{}/advising.html", server.url());
        let doc = fetcher.fetch(&url).await.unwrap();

        mock.assert_async().await;
        assert_eq!(doc.content, "<h1>Advising</h1>");
        assert_eq!(doc.document_id, url);
    }

    #[tokio::test]
    async fn test_http_error_status_is_source_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = HttpSourceFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing", server.url()))
            .await
            .unwrap_err();
        match err {
            AdvisorError::SourceFetch { reason, .. } => assert!(reason.contains("404")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
