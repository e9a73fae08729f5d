use crate::prompt::{PromptStyle, decorate};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use hl_batcher::{FlushSink, FlushedBatch, SessionId};
use hl_channels::{ChannelAdapter, OutboundMessage};
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Where a prepared prompt came from, and where echoes go back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel_id: String,
    /// Sender for private chats, group id for group chats.
    pub peer_id: String,
}

impl Route {
    pub fn new(channel_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            peer_id: peer_id.into(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(format!("{}/{}", self.channel_id, self.peer_id))
    }

    /// Inverse of [`Route::session_id`]. Channel ids never contain `/`; peer
    /// ids may.
    pub fn parse(session_id: &str) -> Option<Self> {
        let (channel_id, peer_id) = session_id.split_once('/')?;
        if channel_id.is_empty() || peer_id.is_empty() {
            return None;
        }
        Some(Self::new(channel_id, peer_id))
    }
}

#[derive(Debug, Clone, Serialize)]
struct WebhookPayload<'a> {
    channel_id: &'a str,
    sender_id: &'a str,
    session_id: &'a str,
    is_group: bool,
    prompt: &'a str,
    truncated: bool,
}

pub struct WebhookClient {
    http: reqwest::Client,
    url: Url,
    auth_token: Option<String>,
}

impl WebhookClient {
    pub fn new(url: &str, auth_token: Option<String>) -> Result<Self> {
        let url = normalize_http_url(url, "downstream.webhook_url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            url,
            auth_token: auth_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<()> {
        let request = self.http.post(self.url.clone()).json(payload);
        let request = match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "webhook relay failed for session {}: status={} body={}",
                payload.session_id,
                status,
                body
            ));
        }
        Ok(())
    }
}

pub enum Downstream {
    /// Reply through the channel the messages arrived on.
    Echo,
    Webhook(WebhookClient),
}

/// A prompt ready to leave the process.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub route: Route,
    pub is_group: bool,
    pub text: String,
    pub truncated: bool,
}

pub struct Relay {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    downstream: Downstream,
    prompt_style: PromptStyle,
}

impl Relay {
    pub fn new(
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        downstream: Downstream,
        prompt_style: PromptStyle,
    ) -> Self {
        Self {
            channels,
            downstream,
            prompt_style,
        }
    }

    pub async fn forward(&self, prepared: Prepared) -> Result<()> {
        let prompt = decorate(
            self.prompt_style,
            &prepared.text,
            chrono::Local::now().naive_local(),
        );
        let session_id = prepared.route.session_id();
        match &self.downstream {
            Downstream::Echo => {
                let channel = self
                    .channels
                    .get(&prepared.route.channel_id)
                    .ok_or_else(|| anyhow!("unknown channel: {}", prepared.route.channel_id))?;
                channel
                    .send(
                        &prepared.route.peer_id,
                        OutboundMessage {
                            content: prompt,
                            reply_to_message_id: None,
                        },
                    )
                    .await?;
            }
            Downstream::Webhook(client) => {
                client
                    .post(&WebhookPayload {
                        channel_id: &prepared.route.channel_id,
                        sender_id: &prepared.route.peer_id,
                        session_id: session_id.as_str(),
                        is_group: prepared.is_group,
                        prompt: &prompt,
                        truncated: prepared.truncated,
                    })
                    .await?;
            }
        }
        tracing::info!(
            session_id = %session_id,
            is_group = prepared.is_group,
            truncated = prepared.truncated,
            chars = prepared.text.chars().count(),
            "prompt relayed downstream"
        );
        Ok(())
    }
}

/// Flush sink that relays each private-chat batch downstream.
pub struct RelaySink {
    relay: Arc<Relay>,
}

impl RelaySink {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl FlushSink for RelaySink {
    async fn on_flush(&self, batch: &FlushedBatch) -> anyhow::Result<()> {
        let route = Route::parse(batch.session_id.as_str())
            .ok_or_else(|| anyhow!("session id has no route: {}", batch.session_id))?;
        self.relay
            .forward(Prepared {
                route,
                is_group: false,
                text: batch.text.clone(),
                truncated: batch.truncated,
            })
            .await
    }

    async fn on_empty(&self, session_id: &SessionId) -> anyhow::Result<()> {
        tracing::debug!(session_id = %session_id, "empty batch dropped");
        Ok(())
    }
}

pub fn normalize_http_url(raw: &str, field: &str) -> Result<Url> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}
