//! Discord webhook notifications: embed construction, batching and pacing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use couchwatch_core::{is_http_url, truncate_chars, Listing, Platform, WebhookConfig};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "couchwatch-notify";

/// Discord allows at most this many embeds per webhook execution.
pub const MAX_EMBEDS_PER_MESSAGE: usize = 10;

/// Pause between webhook executions; Discord's webhook bucket allows roughly
/// 30 requests per minute, so 2.1s keeps a sustained stream under the limit.
pub const DEFAULT_BATCH_PACING: Duration = Duration::from_millis(2100);

const COLOR_CRAIGSLIST: u32 = 0x5C2D91;
const COLOR_FACEBOOK: u32 = 0x1877F2;
const COLOR_DEFAULT: u32 = 0x5865F2;
const COLOR_STARTUP: u32 = 0x00FF00;
const COLOR_ERROR: u32 = 0xFF0000;

fn platform_color(platform: Option<Platform>) -> u32 {
    match platform {
        Some(Platform::Craigslist) => COLOR_CRAIGSLIST,
        Some(Platform::Facebook) => COLOR_FACEBOOK,
        None => COLOR_DEFAULT,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedThumbnail {
    pub url: String,
}

/// One Discord embed, serialized as the webhook API expects.
#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedThumbnail>,
    pub timestamp: String,
}

/// Render a listing as a Discord embed.
pub fn build_embed(listing: &Listing) -> Embed {
    Embed {
        title: truncate_chars(&listing.title, 256),
        url: Some(listing.url.clone()).filter(|u| is_http_url(u)),
        description: listing
            .location
            .as_deref()
            .filter(|l| !l.is_empty())
            .map(|l| format!("\u{1F4CD} {l}")),
        color: platform_color(Some(listing.platform)),
        fields: vec![
            EmbedField {
                name: "Price".to_string(),
                value: listing
                    .price
                    .clone()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "Not listed".to_string()),
                inline: true,
            },
            EmbedField {
                name: "Platform".to_string(),
                value: listing.platform.label().to_string(),
                inline: true,
            },
        ],
        thumbnail: listing
            .image_url
            .clone()
            .filter(|u| is_http_url(u))
            .map(|url| EmbedThumbnail { url }),
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// What a webhook execution came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookReply {
    Delivered,
    RateLimited { retry_after: Duration },
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Wire-level webhook operations, kept behind a trait so the dispatcher can be
/// exercised against a recording fake.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST a payload of embeds with the given content-free body.
    async fn execute(
        &self,
        destination: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookReply, TransportError>;

    /// GET the webhook endpoint; `true` means Discord recognizes it.
    async fn probe(&self, destination: &str) -> Result<bool, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn execute(
        &self,
        destination: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookReply, TransportError> {
        let resp = self.client.post(destination).json(payload).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::NO_CONTENT || status.is_success() {
            return Ok(WebhookReply::Delivered);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // Discord reports the wait either in the JSON body (seconds,
            // possibly fractional) or the Retry-After header.
            let header_wait = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let body_wait = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()));
            let secs = body_wait.or(header_wait).unwrap_or(5.0);
            return Ok(WebhookReply::RateLimited {
                retry_after: Duration::from_secs_f64(secs.max(0.0)),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        Ok(WebhookReply::Rejected {
            status: status.as_u16(),
            body: truncate_chars(&body, 500),
        })
    }

    async fn probe(&self, destination: &str) -> Result<bool, TransportError> {
        let resp = self.client.get(destination).send().await?;
        Ok(resp.status() == reqwest::StatusCode::OK)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub webhooks: WebhookConfig,
    pub max_embeds: usize,
    pub batch_pacing: Duration,
}

impl DispatcherConfig {
    pub fn new(webhooks: WebhookConfig) -> Self {
        Self {
            webhooks,
            max_embeds: MAX_EMBEDS_PER_MESSAGE,
            batch_pacing: DEFAULT_BATCH_PACING,
        }
    }
}

/// Routes new listings to their per-platform webhook destinations, batching
/// embeds and pacing executions to stay under Discord's rate limits.
pub struct Dispatcher<T: WebhookTransport> {
    transport: T,
    config: DispatcherConfig,
}

impl<T: WebhookTransport> Dispatcher<T> {
    pub fn new(transport: T, config: DispatcherConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send notifications for `listings`, grouped per platform in first
    /// appearance order. A failed batch is logged and skipped; later batches
    /// still go out. Returns how many listings were delivered.
    pub async fn dispatch(&self, listings: &[Listing]) -> usize {
        let mut delivered = 0;
        let mut order: Vec<Platform> = Vec::new();
        for listing in listings {
            if !order.contains(&listing.platform) {
                order.push(listing.platform);
            }
        }

        let mut first_batch = true;
        for platform in order {
            let Some(destination) = self.config.webhooks.destination_for(platform) else {
                error!(%platform, "no webhook destination configured; dropping notifications");
                continue;
            };

            let group: Vec<&Listing> = listings
                .iter()
                .filter(|l| l.platform == platform)
                .collect();

            for chunk in group.chunks(self.config.max_embeds) {
                if !first_batch {
                    tokio::time::sleep(self.config.batch_pacing).await;
                }
                first_batch = false;

                let embeds: Vec<Embed> = chunk.iter().map(|l| build_embed(l)).collect();
                let payload = json!({ "embeds": embeds });
                if self.send_batch(destination, &payload).await {
                    delivered += chunk.len();
                    info!(%platform, count = chunk.len(), "notified");
                }
            }
        }

        delivered
    }

    /// Execute one webhook call, retrying exactly once after a rate limit.
    async fn send_batch(&self, destination: &str, payload: &serde_json::Value) -> bool {
        match self.transport.execute(destination, payload).await {
            Ok(WebhookReply::Delivered) => true,
            Ok(WebhookReply::RateLimited { retry_after }) => {
                warn!(wait_secs = retry_after.as_secs_f64(), "webhook rate limited");
                tokio::time::sleep(retry_after).await;
                match self.transport.execute(destination, payload).await {
                    Ok(WebhookReply::Delivered) => true,
                    Ok(reply) => {
                        error!(?reply, "webhook retry failed; dropping batch");
                        false
                    }
                    Err(err) => {
                        error!(error = %err, "webhook retry failed; dropping batch");
                        false
                    }
                }
            }
            Ok(WebhookReply::Rejected { status, body }) => {
                error!(status, body, "webhook rejected; dropping batch");
                false
            }
            Err(err) => {
                error!(error = %err, "webhook request failed; dropping batch");
                false
            }
        }
    }

    /// Best-effort single-embed broadcast to every configured destination.
    async fn broadcast(&self, embed: Embed) {
        let payload = json!({ "embeds": [embed] });
        for destination in self.config.webhooks.all_destinations() {
            if let Err(err) = self.transport.execute(destination, &payload).await {
                warn!(error = %err, "announcement delivery failed");
            }
        }
    }

    /// Announce that monitoring has started, with the active search setup.
    pub async fn announce_startup(&self, terms: &[String], min_price: u32, max_price: u32) {
        self.broadcast(Embed {
            title: "\u{1F6CB} Couchwatch started".to_string(),
            url: None,
            description: Some(format!(
                "Watching for: {}\nPrice range: ${min_price} - ${max_price}",
                terms.join(", ")
            )),
            color: COLOR_STARTUP,
            fields: Vec::new(),
            thumbnail: None,
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
    }

    /// Best-effort crash notification; never fails the caller.
    pub async fn announce_error(&self, detail: &str) {
        self.broadcast(Embed {
            title: "\u{26A0} Couchwatch stopped".to_string(),
            url: None,
            description: Some(truncate_chars(detail, 2000)),
            color: COLOR_ERROR,
            fields: Vec::new(),
            thumbnail: None,
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
    }

    /// Probe each configured destination once at startup, logging the outcome.
    pub async fn verify_destinations(&self) {
        for destination in self.config.webhooks.all_destinations() {
            match self.transport.probe(destination).await {
                Ok(true) => debug!("webhook destination verified"),
                Ok(false) => warn!("webhook destination rejected verification probe"),
                Err(err) => warn!(error = %err, "webhook destination unreachable"),
            }
        }
    }
}
