//! Passive display: keeps a local view of one session's transcript.
//!
//! `poll` pulls on a fixed interval; `follow` subscribes to the push stream
//! and falls back to a pull whenever it may have missed something.

use crate::broadcast::TranscriptEvent;
use crate::sse::{SseDecoder, SseEvent};
use crate::transcript::TranscriptMessage;
use anyhow::{Context, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// What `follow` hands to its callback
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorUpdate {
    /// A pushed change
    Event(TranscriptEvent),
    /// The full transcript, pulled after connecting or after a gap
    Resync(Vec<TranscriptMessage>),
}

#[derive(Debug, Clone)]
pub struct MirrorClient {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
    timeout: Duration,
}

impl MirrorClient {
    pub fn new(base_url: &str, session_id: &str, timeout: Duration) -> Result<Self> {
        // No client-wide timeout: the event stream stays open indefinitely
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build mirror HTTP client")?;
        Ok(MirrorClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            timeout,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Pull the current transcript
    pub async fn fetch_transcript(&self) -> Result<Vec<TranscriptMessage>> {
        let response = self
            .client
            .get(format!("{}/api/transcript", self.base_url))
            .query(&[("sessionId", self.session_id.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .context("Transcript request failed")?
            .error_for_status()
            .context("Transcript request rejected")?;

        response
            .json()
            .await
            .context("Failed to parse transcript")
    }

    /// Poll until `cancel` fires, calling `render` on the first successful
    /// fetch and whenever the transcript differs from the last one rendered.
    pub async fn poll<F>(
        &self,
        period: Duration,
        cancel: CancellationToken,
        mut render: F,
    ) -> Result<()>
    where
        F: FnMut(&[TranscriptMessage]),
    {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Vec<TranscriptMessage>> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Mirror poll for {} cancelled", self.session_id);
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.fetch_transcript().await {
                Ok(messages) => {
                    if last.as_ref() != Some(&messages) {
                        render(&messages);
                        last = Some(messages);
                    }
                }
                Err(err) => warn!("Transcript poll failed, retrying next tick: {:#}", err),
            }
        }
    }

    /// Follow the push stream until `cancel` fires, reconnecting when it ends
    pub async fn follow<F>(&self, cancel: CancellationToken, mut on_update: F) -> Result<()>
    where
        F: FnMut(MirrorUpdate),
    {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                result = self.follow_once(&mut on_update) => {
                    if let Err(err) = result {
                        warn!("Event stream for {} failed: {:#}", self.session_id, err);
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn follow_once<F>(&self, on_update: &mut F) -> Result<()>
    where
        F: FnMut(MirrorUpdate),
    {
        let response = self
            .client
            .get(format!("{}/api/events", self.base_url))
            .query(&[("sessionId", self.session_id.as_str())])
            .send()
            .await
            .context("Event stream request failed")?
            .error_for_status()
            .context("Event stream rejected")?;
        info!("Following events for session {}", self.session_id);

        // Subscribed first, so the pull cannot miss anything pushed after it
        on_update(MirrorUpdate::Resync(self.fetch_transcript().await?));

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(bytes) = body.next().await {
            let bytes = bytes.context("Event stream interrupted")?;
            for event in decoder.push(&bytes) {
                self.dispatch(event, on_update).await?;
            }
        }
        if let Some(event) = decoder.finish() {
            self.dispatch(event, on_update).await?;
        }

        // Anything published before the reconnect is only visible by pulling
        on_update(MirrorUpdate::Resync(self.fetch_transcript().await?));
        Ok(())
    }

    async fn dispatch<F>(&self, event: SseEvent, on_update: &mut F) -> Result<()>
    where
        F: FnMut(MirrorUpdate),
    {
        match event.event.as_deref() {
            Some("new-message") | Some("clear") => match serde_json::from_str(&event.data) {
                Ok(parsed) => on_update(MirrorUpdate::Event(parsed)),
                Err(err) => warn!("Ignoring malformed event {:?}: {}", event.data, err),
            },
            Some("resync") => on_update(MirrorUpdate::Resync(self.fetch_transcript().await?)),
            other => debug!("Ignoring event {:?}", other),
        }
        Ok(())
    }
}

/// Plain-text rendering of a transcript
pub fn render_transcript(messages: &[TranscriptMessage]) -> String {
    if messages.is_empty() {
        return "(no messages yet)".to_string();
    }
    messages
        .iter()
        .map(|message| {
            format!(
                "[{}] {}: {}",
                message.timestamp.format("%H:%M:%S"),
                message.role,
                message.content
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}
