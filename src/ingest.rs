use crate::chunking::{chunk_document, ChunkingConfig};
use crate::document::{SourceFetcher, DEFAULT_FETCH_TIMEOUT};
use crate::embeddings::{embed_chunks, Embedder};
use crate::error::{AdvisorError, AdvisorResult};
use crate::vector_store::VectorStore;
use anyhow::{Context, Result};
use futures::future::join_all;
use log::{info, warn};
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// What to ingest and how to chunk it
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub sources: Vec<String>,
    pub chunking: ChunkingConfig,
    pub fetch_timeout: Duration,
}

impl IngestConfig {
    pub fn new(sources: Vec<String>) -> Self {
        IngestConfig {
            sources,
            chunking: ChunkingConfig::default(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Read `ADVISOR_SOURCE_URLS` (comma or whitespace separated) and the chunking settings
    pub fn from_env() -> Result<Self> {
        let sources = env::var("ADVISOR_SOURCE_URLS")
            .map(|value| parse_source_list(&value))
            .unwrap_or_default();
        let fetch_timeout = match env::var("ADVISOR_FETCH_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.trim()
                    .parse()
                    .context("ADVISOR_FETCH_TIMEOUT_SECS must be an integer")?,
            ),
            Err(_) => DEFAULT_FETCH_TIMEOUT,
        };

        Ok(IngestConfig {
            sources,
            chunking: ChunkingConfig::from_env()?,
            fetch_timeout,
        })
    }
}

fn parse_source_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Outcome of one successful ingestion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub generation: u64,
    pub sources_ingested: usize,
    pub sources_failed: Vec<String>,
    pub chunks: usize,
    pub elapsed_ms: u64,
}

/// Readiness flag, kept behind a trait so it can live in a shared store
pub trait IngestionState: Send + Sync {
    fn is_ready(&self) -> bool;
    fn mark_ready(&self);
    fn reset(&self);
}

#[derive(Debug, Default)]
pub struct InMemoryIngestionState {
    ready: AtomicBool,
}

impl IngestionState for InMemoryIngestionState {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Flight {
    report: Option<IngestReport>,
    last_error: Option<AdvisorError>,
}

/// Runs fetch, chunk, embed and load once, for every caller.
///
/// `ensure_ready` is single-flight: callers arriving while an attempt is in
/// progress wait for it and share its outcome instead of starting their own.
pub struct IngestionCoordinator {
    config: IngestConfig,
    fetcher: Arc<dyn SourceFetcher>,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    state: Arc<dyn IngestionState>,
    flight: Mutex<Flight>,
    /// Number of finished attempts, successful or not
    completed: AtomicU64,
}

impl IngestionCoordinator {
    pub fn new(
        config: IngestConfig,
        fetcher: Arc<dyn SourceFetcher>,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
    ) -> Self {
        Self::with_state(
            config,
            fetcher,
            embedder,
            store,
            Arc::new(InMemoryIngestionState::default()),
        )
    }

    pub fn with_state(
        config: IngestConfig,
        fetcher: Arc<dyn SourceFetcher>,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        state: Arc<dyn IngestionState>,
    ) -> Self {
        IngestionCoordinator {
            config,
            fetcher,
            embedder,
            store,
            state,
            flight: Mutex::new(Flight::default()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Report of the ingestion currently serving searches.
    ///
    /// Never waits: returns `None` while an attempt holds the flight lock.
    pub fn last_report(&self) -> Option<IngestReport> {
        self.flight.try_lock().ok().and_then(|flight| flight.report.clone())
    }

    /// Ingest once; later calls return the first successful report
    pub async fn ensure_ready(&self) -> AdvisorResult<IngestReport> {
        let observed = self.completed.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;

        if self.state.is_ready() {
            if let Some(report) = &flight.report {
                return Ok(report.clone());
            }
        }

        // An attempt finished while we were queued behind it: share its failure
        if self.completed.load(Ordering::Acquire) != observed {
            if let Some(err) = &flight.last_error {
                return Err(err.clone());
            }
        }

        let outcome = self.ingest().await;
        self.completed.fetch_add(1, Ordering::AcqRel);
        match outcome {
            Ok(report) => {
                self.state.mark_ready();
                flight.report = Some(report.clone());
                flight.last_error = None;
                Ok(report)
            }
            Err(err) => {
                warn!("Ingestion attempt failed: {}", err);
                flight.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Forget the current readiness so the next `ensure_ready` re-ingests
    pub async fn reset(&self) {
        let mut flight = self.flight.lock().await;
        self.state.reset();
        flight.report = None;
        flight.last_error = None;
        info!("Ingestion state reset");
    }

    async fn ingest(&self) -> AdvisorResult<IngestReport> {
        let started = Instant::now();
        info!("Ingesting {} source(s)", self.config.sources.len());

        let fetches = self
            .config
            .sources
            .iter()
            .map(|url| self.fetcher.fetch(url));
        let documents = join_all(fetches).await;

        let mut chunks = Vec::new();
        let mut sources_failed = Vec::new();
        let mut sources_ingested = 0;

        for (url, document) in self.config.sources.iter().zip(documents) {
            match document {
                Ok(document) => {
                    let doc_chunks = chunk_document(
                        &document.content,
                        &document.document_id,
                        &self.config.chunking,
                    );
                    info!("Split {} into {} chunks", url, doc_chunks.len());
                    chunks.extend(doc_chunks);
                    sources_ingested += 1;
                }
                Err(err) => {
                    warn!("Skipping source {}: {}", url, err);
                    sources_failed.push(url.clone());
                }
            }
        }

        if !self.config.sources.is_empty() && sources_ingested == 0 {
            return Err(AdvisorError::Ingestion(format!(
                "all {} sources failed to fetch",
                self.config.sources.len()
            )));
        }
        if self.config.sources.is_empty() {
            warn!("No sources configured; answers will have no retrieved context");
        }

        embed_chunks(self.embedder.as_ref(), &mut chunks).await?;

        let chunk_count = chunks.len();
        let generation = self.store.load(chunks);
        let report = IngestReport {
            generation,
            sources_ingested,
            sources_failed,
            chunks: chunk_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Loaded {} chunks from {} source(s) as generation {}",
            report.chunks, report.sources_ingested, report.generation
        );
        Ok(report)
    }
}
