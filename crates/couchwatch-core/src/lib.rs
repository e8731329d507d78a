//! Core domain model and configuration for Couchwatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "couchwatch-core";

/// Longest title we carry; Discord embed titles cap at 256 and we stay under it.
pub const MAX_TITLE_LEN: usize = 200;

/// Marketplace a listing was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Craigslist,
    Facebook,
}

impl Platform {
    /// Stable lowercase identifier used in storage rows and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Craigslist => "craigslist",
            Platform::Facebook => "facebook",
        }
    }

    /// Human-facing label used in notification messages.
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Craigslist => "Craigslist",
            Platform::Facebook => "Facebook",
        }
    }

    /// Prefix applied to native listing identifiers to make ids globally unique.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Platform::Craigslist => "cl",
            Platform::Facebook => "fb",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered marketplace posting.
///
/// Immutable once built by an adapter; `first_seen` is assigned by the store at
/// persistence time and therefore does not live here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub platform: Platform,
    pub title: String,
    pub price: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub location: Option<String>,
}

impl Listing {
    pub fn new(
        id: String,
        platform: Platform,
        title: &str,
        price: Option<String>,
        url: String,
        image_url: Option<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            id,
            platform,
            title: truncate_chars(title, MAX_TITLE_LEN),
            price,
            url,
            image_url: sanitize_image_url(image_url),
            location,
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    input.chars().take(max).collect()
}

/// True for absolute `http(s)` URLs, the only scheme notification embeds accept.
pub fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Drop placeholder and non-web image URLs; keeps only real `http(s)` links.
pub fn sanitize_image_url(image_url: Option<String>) -> Option<String> {
    let url = image_url?;
    if url.is_empty() || !is_http_url(&url) || url.to_ascii_lowercase().contains("blank") {
        return None;
    }
    Some(url)
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub zip: String,
    pub radius_miles: u32,
    /// Fallback location label when a platform cannot extract one.
    pub default_label: String,
}

#[derive(Debug, Clone)]
pub struct CraigslistConfig {
    pub base_url: String,
    /// Search categories, e.g. `fua` (furniture by owner).
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FacebookConfig {
    pub marketplace_url: String,
    pub login_url: String,
    pub login_timeout: Duration,
    pub login_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub craigslist_url: Option<String>,
    pub facebook_url: Option<String>,
    pub default_url: Option<String>,
}

impl WebhookConfig {
    /// Destination for a platform: platform-specific if configured, else default.
    pub fn destination_for(&self, platform: Platform) -> Option<&str> {
        let specific = match platform {
            Platform::Craigslist => self.craigslist_url.as_deref(),
            Platform::Facebook => self.facebook_url.as_deref(),
        };
        specific
            .filter(|u| !u.is_empty())
            .or(self.default_url.as_deref().filter(|u| !u.is_empty()))
    }

    /// Every distinct configured destination, for broadcast announcements.
    pub fn all_destinations(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for url in [
            self.craigslist_url.as_deref(),
            self.facebook_url.as_deref(),
            self.default_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if !url.is_empty() && !out.contains(&url) {
                out.push(url);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub search_terms: Vec<String>,
    pub min_price: u32,
    pub max_price: u32,
    pub location: LocationConfig,
    pub check_interval: Duration,
    /// Delay between successive search-term requests against one platform.
    pub term_pacing: Duration,
    pub retention_days: i64,
    pub headless: bool,
    pub database_url: String,
    pub user_agent: String,
    pub craigslist: CraigslistConfig,
    pub facebook: FacebookConfig,
    pub webhooks: WebhookConfig,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            search_terms: std::env::var("SEARCH_TERMS")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| default_search_terms()),
            min_price: env_parsed("MIN_PRICE", 0),
            max_price: env_parsed("MAX_PRICE", 1000),
            location: LocationConfig {
                zip: std::env::var("LOCATION_ZIP").unwrap_or_else(|_| "43215".to_string()),
                radius_miles: env_parsed("LOCATION_RADIUS_MILES", 100),
                default_label: std::env::var("LOCATION_LABEL")
                    .unwrap_or_else(|_| "Columbus, OH".to_string()),
            },
            check_interval: Duration::from_secs(env_parsed("CHECK_INTERVAL_SECONDS", 60)),
            term_pacing: Duration::from_millis(env_parsed("TERM_PACING_MILLIS", 1000)),
            retention_days: env_parsed("RETENTION_DAYS", 7),
            headless: std::env::var("HEADLESS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:couchwatch.db".to_string()),
            user_agent: std::env::var("COUCHWATCH_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string()
            }),
            craigslist: CraigslistConfig {
                base_url: std::env::var("CRAIGSLIST_BASE_URL")
                    .unwrap_or_else(|_| "https://columbus.craigslist.org".to_string()),
                categories: vec!["fua".to_string()],
            },
            facebook: FacebookConfig {
                marketplace_url: std::env::var("FACEBOOK_MARKETPLACE_URL")
                    .unwrap_or_else(|_| "https://www.facebook.com/marketplace/columbus".to_string()),
                login_url: "https://www.facebook.com/login".to_string(),
                login_timeout: Duration::from_secs(env_parsed("LOGIN_TIMEOUT_SECONDS", 300)),
                login_poll_interval: Duration::from_secs(env_parsed("LOGIN_POLL_SECONDS", 10)),
            },
            webhooks: WebhookConfig {
                craigslist_url: env_nonempty("DISCORD_WEBHOOK_CRAIGSLIST"),
                facebook_url: env_nonempty("DISCORD_WEBHOOK_FACEBOOK"),
                default_url: env_nonempty("DISCORD_WEBHOOK_URL"),
            },
        }
    }
}

fn default_search_terms() -> Vec<String> {
    ["sectional", "L-shaped", "U-shaped", "modular sofa"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
