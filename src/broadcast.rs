//! Realtime fan-out of transcript changes to passive displays.
//!
//! Delivery is at-most-once: a subscriber that is not connected when an
//! event is published never sees it and reconciles by pulling the
//! transcript instead.

use crate::error::{AdvisorError, AdvisorResult};
use crate::transcript::Role;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

type HmacSha256 = Hmac<Sha256>;

const LOCAL_CHANNEL_CAPACITY: usize = 64;

/// Event carried on a session channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TranscriptEvent {
    Message {
        role: Role,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Clear {
        timestamp: DateTime<Utc>,
    },
}

impl TranscriptEvent {
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        TranscriptEvent::Message {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn clear() -> Self {
        TranscriptEvent::Clear {
            timestamp: Utc::now(),
        }
    }

    /// Event name used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            TranscriptEvent::Message { .. } => "new-message",
            TranscriptEvent::Clear { .. } => "clear",
        }
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, session_id: &str, event: &TranscriptEvent) -> AdvisorResult<()>;

    async fn publish_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> AdvisorResult<()> {
        self.publish(session_id, &TranscriptEvent::message(role, content))
            .await
    }

    async fn publish_clear(&self, session_id: &str) -> AdvisorResult<()> {
        self.publish(session_id, &TranscriptEvent::clear()).await
    }
}

/// In-process channels, one per session, consumed by the `/api/events` stream
#[derive(Debug)]
pub struct LocalBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<TranscriptEvent>>>,
    capacity: usize,
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        LocalBroadcaster {
            channels: Mutex::new(HashMap::new()),
            capacity: LOCAL_CHANNEL_CAPACITY,
        }
    }
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<TranscriptEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        // Sessions whose displays have all disconnected
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn publish(&self, session_id: &str, event: &TranscriptEvent) -> AdvisorResult<()> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(session_id) {
            if sender.send(event.clone()).is_err() {
                // Every subscriber has gone away
                channels.remove(session_id);
            }
        }
        Ok(())
    }
}

/// Credentials for the Pusher Channels HTTP API
#[derive(Debug, Clone)]
pub struct PusherConfig {
    pub app_id: String,
    pub key: String,
    pub secret: String,
    pub cluster: String,
    /// Overrides `https://api-{cluster}.pusher.com`
    pub host: Option<String>,
    pub timeout: Duration,
}

impl PusherConfig {
    /// `None` when no Pusher variable is set; an error when only some are
    pub fn from_env() -> Result<Option<Self>> {
        let names = ["PUSHER_APP_ID", "PUSHER_KEY", "PUSHER_SECRET", "PUSHER_CLUSTER"];
        let values: Vec<Option<String>> = names
            .iter()
            .map(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))
            .collect();

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }

        match values.as_slice() {
            [Some(app_id), Some(key), Some(secret), Some(cluster)] => Ok(Some(PusherConfig {
                app_id: app_id.clone(),
                key: key.clone(),
                secret: secret.clone(),
                cluster: cluster.clone(),
                host: env::var("PUSHER_HOST").ok(),
                timeout: Duration::from_secs(5),
            })),
            _ => {
                let missing: Vec<&str> = names
                    .iter()
                    .zip(&values)
                    .filter(|(_, value)| value.is_none())
                    .map(|(name, _)| *name)
                    .collect();
                bail!("Pusher is partially configured; missing {}", missing.join(", "))
            }
        }
    }

    fn base_url(&self) -> String {
        match &self.host {
            Some(host) => host.trim_end_matches('/').to_string(),
            None => format!("https://api-{}.pusher.com", self.cluster),
        }
    }
}

#[derive(Serialize)]
struct TriggerBody<'a> {
    name: &'a str,
    channels: [&'a str; 1],
    data: String,
}

/// Publishes transcript events through Pusher's REST trigger endpoint
#[derive(Clone)]
pub struct PusherBroadcaster {
    config: PusherConfig,
    client: reqwest::Client,
}

impl PusherBroadcaster {
    pub fn new(config: PusherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build Pusher HTTP client")?;
        Ok(PusherBroadcaster { config, client })
    }

    /// Signed query string for `POST {path}` with `body`
    fn signed_query(&self, path: &str, body: &str, timestamp: i64) -> AdvisorResult<String> {
        let body_md5 = hex::encode(Md5::digest(body.as_bytes()));
        let query = format!(
            "auth_key={}&auth_timestamp={}&auth_version=1.0&body_md5={}",
            self.config.key, timestamp, body_md5
        );

        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .map_err(|e| AdvisorError::Broadcast(format!("invalid Pusher secret: {}", e)))?;
        mac.update(format!("POST\n{}\n{}", path, query).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&auth_signature={}", query, signature))
    }
}

/// Pusher channel names allow `[A-Za-z0-9_\-=@,.;]`
pub fn channel_name(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_-=@,.;".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("advisor-{}", sanitized)
}

#[async_trait]
impl Broadcaster for PusherBroadcaster {
    async fn publish(&self, session_id: &str, event: &TranscriptEvent) -> AdvisorResult<()> {
        let channel = channel_name(session_id);
        let data = serde_json::to_string(event)
            .map_err(|e| AdvisorError::Broadcast(e.to_string()))?;
        let body = serde_json::to_string(&TriggerBody {
            name: event.name(),
            channels: [channel.as_str()],
            data,
        })
        .map_err(|e| AdvisorError::Broadcast(e.to_string()))?;

        let path = format!("/apps/{}/events", self.config.app_id);
        let query = self.signed_query(&path, &body, Utc::now().timestamp())?;
        let url = format!("{}{}?{}", self.config.base_url(), path, query);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| AdvisorError::Broadcast(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AdvisorError::Broadcast(format!(
                "Pusher rejected event: {} {}",
                status, error_text
            )));
        }

        debug!("Published {} on {}", event.name(), channel);
        Ok(())
    }
}

/// Publishes to every target; one failing target does not stop the others
#[derive(Default, Clone)]
pub struct FanoutBroadcaster {
    targets: Vec<Arc<dyn Broadcaster>>,
}

impl FanoutBroadcaster {
    pub fn new(targets: Vec<Arc<dyn Broadcaster>>) -> Self {
        FanoutBroadcaster { targets }
    }
}

#[async_trait]
impl Broadcaster for FanoutBroadcaster {
    async fn publish(&self, session_id: &str, event: &TranscriptEvent) -> AdvisorResult<()> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(err) = target.publish(session_id, event).await {
                warn!("Broadcast to session {} failed: {}", session_id, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
