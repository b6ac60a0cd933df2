use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use campus_advisor::broadcast::{
    Broadcaster, FanoutBroadcaster, LocalBroadcaster, PusherBroadcaster, PusherConfig,
};
use campus_advisor::document::HttpSourceFetcher;
use campus_advisor::gemini::{GeminiClient, GeminiConfig};
use campus_advisor::ingest::{IngestConfig, IngestionCoordinator};
use campus_advisor::mirror::{render_transcript, MirrorClient, MirrorUpdate};
use campus_advisor::rag::{RagEngine, DEFAULT_TOP_K};
use campus_advisor::server::{self, AppState};
use campus_advisor::transcript::InMemoryTranscripts;
use campus_advisor::vector_store::VectorStore;

/// Campus advisor: answers academic-planning questions from published catalog pages
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of chunks retrieved per question
    #[arg(long, env = "ADVISOR_TOP_K", default_value_t = DEFAULT_TOP_K, global = true)]
    top_k: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "ADVISOR_BIND", default_value = "127.0.0.1:8787")]
        bind: SocketAddr,

        /// Start ingestion in the background at boot
        #[arg(long)]
        warm: bool,
    },
    /// Ask questions interactively in the terminal
    Chat,
    /// Ingest the configured sources once and print the report
    Ingest,
    /// Display a session's transcript as it changes
    Mirror {
        #[arg(long, env = "ADVISOR_URL", default_value = "http://127.0.0.1:8787")]
        url: String,

        #[arg(long, default_value = "demo")]
        session: String,

        /// Seconds between transcript pulls
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,

        /// Follow the push event stream instead of polling
        #[arg(long)]
        push: bool,
    },
}

/// Wire the fetcher, Gemini client and store into an engine
fn build_engine(top_k: usize) -> Result<RagEngine> {
    let ingest_config = IngestConfig::from_env().context("Invalid ingestion settings")?;
    let gemini_config = GeminiConfig::from_env().context("Missing GEMINI_API_KEY")?;

    if ingest_config.sources.is_empty() {
        warn!("ADVISOR_SOURCE_URLS is empty; answers will have no catalog context");
    }

    let fetcher = HttpSourceFetcher::new(ingest_config.fetch_timeout)
        .context("Failed to build source fetcher")?;
    let gemini = Arc::new(GeminiClient::new(gemini_config)?);

    let coordinator = Arc::new(IngestionCoordinator::new(
        ingest_config,
        Arc::new(fetcher),
        gemini.clone(),
        Arc::new(VectorStore::new()),
    ));

    Ok(RagEngine::new(coordinator, gemini.clone(), gemini).with_top_k(top_k))
}

fn build_broadcaster(events: Arc<LocalBroadcaster>) -> Result<Arc<dyn Broadcaster>> {
    let mut targets: Vec<Arc<dyn Broadcaster>> = vec![events as Arc<dyn Broadcaster>];
    match PusherConfig::from_env()? {
        Some(config) => {
            info!("Publishing transcript events to Pusher cluster {}", config.cluster);
            targets.push(Arc::new(PusherBroadcaster::new(config)?));
        }
        None => info!("Pusher not configured; events are served on /api/events only"),
    }
    Ok(Arc::new(FanoutBroadcaster::new(targets)))
}

/// Cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", err);
        }
        trigger.cancel();
    });
    token
}

async fn serve(bind: SocketAddr, warm: bool, top_k: usize) -> Result<()> {
    let engine = match build_engine(top_k) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(err) => {
            warn!("Chat is disabled: {:#}", err);
            None
        }
    };

    if warm {
        if let Some(engine) = &engine {
            let coordinator = engine.coordinator().clone();
            tokio::spawn(async move {
                match coordinator.ensure_ready().await {
                    Ok(report) => info!("Warm-up ingested {} chunks", report.chunks),
                    Err(err) => error!("Warm-up ingestion failed: {}", err),
                }
            });
        }
    }

    let events = Arc::new(LocalBroadcaster::new());
    let state = AppState {
        engine,
        transcripts: Arc::new(InMemoryTranscripts::new()),
        broadcaster: build_broadcaster(events.clone())?,
        events,
    };

    let cancel = shutdown_token();
    server::serve(state, bind, async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn mirror(url: &str, session: &str, interval_secs: u64, push: bool) -> Result<()> {
    let client = MirrorClient::new(url, session, Duration::from_secs(10))?;
    let cancel = shutdown_token();
    info!("Mirroring session {} from {}", client.session_id(), url);

    if push {
        client
            .follow(cancel, |update| match update {
                MirrorUpdate::Resync(messages) => {
                    println!("{}", render_transcript(&messages));
                }
                MirrorUpdate::Event(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(err) => error!("Failed to render event: {}", err),
                },
            })
            .await
    } else {
        let period = Duration::from_secs(interval_secs.max(1));
        client
            .poll(period, cancel, |messages| {
                println!("{}\n", render_transcript(messages));
            })
            .await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Command::Serve { bind, warm } => serve(bind, warm, args.top_k).await,
        Command::Chat => {
            let engine = build_engine(args.top_k)?;
            engine
                .run_query_loop()
                .await
                .context("Error in query loop")
        }
        Command::Ingest => {
            let engine = build_engine(args.top_k)?;
            let report = engine
                .coordinator()
                .ensure_ready()
                .await
                .context("Ingestion failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Mirror {
            url,
            session,
            interval_secs,
            push,
        } => mirror(&url, &session, interval_secs, push).await,
    }
}
