//! Platform adapter contracts + Craigslist/Facebook Marketplace implementations.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use couchwatch_core::{sanitize_image_url, Listing, MonitorConfig, Platform};
use couchwatch_storage::{FetchError, HttpClientConfig, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "couchwatch-adapters";

/// Titles must contain one of these or the record is discarded; broad search
/// terms like "U-shaped" otherwise match boots, cushions, stair balusters.
const FURNITURE_KEYWORDS: &[&str] = &[
    "sectional",
    "sofa",
    "couch",
    "loveseat",
    "chaise",
    "recliner",
    "furniture",
    "seating",
    "living room",
    "modular",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Headless,
    Attended,
}

/// A fully rendered page: the URL navigation settled on plus its markup.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation timed out for {url}")]
    Timeout { url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("browser surface failure: {0}")]
    Surface(String),
}

/// Capability set adapters require from the rendering layer.
///
/// The raw mechanics (launching an engine, anti-detection, network idling) live
/// behind this trait; the monitor owns one surface per adapter and lends it for
/// the duration of each call.
#[async_trait]
pub trait BrowserSurface: Send {
    /// Navigate to `url` and return the settled page.
    async fn render(&mut self, url: &str) -> Result<RenderedPage, RenderError>;

    /// Make newest-first result ordering take effect on the current results
    /// page, through whatever mechanism the site actually respects (for
    /// Facebook that is a UI-level sort control, not the request parameter).
    /// Returns the page as re-rendered after sorting when ordering is
    /// verified to be in effect, `None` otherwise. Sorting mutates the live
    /// page, so callers must only apply early-stop to the markup returned
    /// here, never to a snapshot captured earlier.
    async fn ensure_newest_first(&mut self) -> Result<Option<RenderedPage>, RenderError>;

    /// Tear down and relaunch the surface in the given visibility mode.
    /// Session state is expected to survive the restart.
    async fn restart(&mut self, mode: Visibility) -> Result<(), RenderError>;

    /// Flush cookies/session state to durable storage so a process restart
    /// resumes an authenticated session.
    async fn persist_session(&mut self) -> Result<(), RenderError>;
}

/// Plain-HTTP surface for platforms that render search results server-side.
///
/// It cannot interact with page chrome, so `ensure_newest_first` returns
/// `None`: ordering is whatever the request parameters produced.
pub struct HttpSurface {
    fetcher: HttpFetcher,
}

impl HttpSurface {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(user_agent.to_string()),
            ..Default::default()
        })?;
        Ok(Self { fetcher })
    }
}

#[async_trait]
impl BrowserSurface for HttpSurface {
    async fn render(&mut self, url: &str) -> Result<RenderedPage, RenderError> {
        let page = self.fetcher.fetch_text("http-surface", url).await?;
        Ok(RenderedPage {
            final_url: page.final_url,
            html: page.body,
        })
    }

    async fn ensure_newest_first(&mut self) -> Result<Option<RenderedPage>, RenderError> {
        Ok(None)
    }

    async fn restart(&mut self, _mode: Visibility) -> Result<(), RenderError> {
        Ok(())
    }

    async fn persist_session(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("{0}")]
    Message(String),
}

/// Result of scanning one results page for one search term.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub listings: Vec<Listing>,
    pub early_stopped: bool,
}

impl ScanOutcome {
    fn merge(&mut self, other: ScanOutcome) {
        self.listings.extend(other.listings);
        self.early_stopped |= other.early_stopped;
    }
}

/// Walk candidate records in page order, skipping records whose id repeats
/// within the page and parsing only genuinely new ones.
///
/// When `early_stop` is set (ordering verified newest-first), the first id
/// found in `seen` ends the scan: everything below it is older and known.
/// Otherwise seen records are skipped individually and the scan continues.
/// Records with no derivable id, or that `parse` rejects, are skipped without
/// aborting the page.
pub fn scan_newest_first<R>(
    records: impl IntoIterator<Item = R>,
    seen: &HashSet<String>,
    early_stop: bool,
    mut id_of: impl FnMut(&R) -> Option<String>,
    mut parse: impl FnMut(&R, String) -> Option<Listing>,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut page_ids: HashSet<String> = HashSet::new();

    for record in records {
        let Some(id) = id_of(&record) else {
            continue;
        };
        if !page_ids.insert(id.clone()) {
            continue;
        }
        if seen.contains(&id) {
            if early_stop {
                debug!(%id, "early stop: hit known listing");
                outcome.early_stopped = true;
                break;
            }
            continue;
        }
        if let Some(listing) = parse(&record, id) {
            outcome.listings.push(listing);
        }
    }

    outcome
}

/// One marketplace the monitor knows how to read.
#[async_trait]
pub trait PlatformAdapter: Send {
    fn platform(&self) -> Platform;

    /// Access check before a cycle; `false` means the platform is unreachable
    /// and the adapter should be skipped for this cycle (not an error).
    async fn prepare(&mut self, _surface: &mut dyn BrowserSurface) -> Result<bool, AdapterError> {
        Ok(true)
    }

    /// Fetch and extract new listings for one search term, deduplicated
    /// against `seen` with early-stop where the ordering guarantee holds.
    async fn scan_term(
        &mut self,
        surface: &mut dyn BrowserSurface,
        term: &str,
        seen: &HashSet<String>,
    ) -> Result<ScanOutcome, AdapterError>;
}

fn selector(source: &str) -> Result<Selector, AdapterError> {
    Selector::parse(source).map_err(|e| AdapterError::Message(format!("selector {source}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Stable fallback id when the native identifier cannot be extracted: a
/// truncated content hash of the URL, identical across runs.
fn hashed_id(platform: Platform, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}", platform.id_prefix(), &digest[..16])
}

fn absolute_url(base: &str, href: &str) -> String {
    if href.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), href)
    } else {
        href.to_string()
    }
}

// ---------------------------------------------------------------------------
// Craigslist
// ---------------------------------------------------------------------------

/// Craigslist search-result adapter.
///
/// Craigslist honors `sort=date` in the request itself, so pages arrive
/// newest-first and early-stop applies regardless of surface capabilities.
pub struct CraigslistAdapter {
    base_url: String,
    categories: Vec<String>,
    min_price: u32,
    max_price: u32,
    default_location: String,
    id_re: Regex,
}

impl CraigslistAdapter {
    pub fn new(config: &MonitorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.craigslist.base_url.clone(),
            categories: config.craigslist.categories.clone(),
            min_price: config.min_price,
            max_price: config.max_price,
            default_location: config.location.default_label.clone(),
            id_re: Regex::new(r"/(\d+)\.html")?,
        })
    }

    fn search_url(&self, category: &str, term: &str) -> Result<String, AdapterError> {
        let url = Url::parse_with_params(
            &format!("{}/search/{}", self.base_url.trim_end_matches('/'), category),
            [
                ("query", term),
                ("min_price", &self.min_price.to_string()),
                ("max_price", &self.max_price.to_string()),
                ("sort", "date"),
                ("searchNearby", "1"),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("building craigslist search url: {e}")))?;
        Ok(url.to_string())
    }

    fn listing_id(&self, url: &str) -> String {
        match self.id_re.captures(url).and_then(|c| c.get(1)) {
            Some(native) => format!("cl_{}", native.as_str()),
            None => hashed_id(Platform::Craigslist, url),
        }
    }

    fn parse_page(&self, html: &str, seen: &HashSet<String>) -> Result<ScanOutcome, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = selector("div.gallery-card")?;
        let title_link_sel = selector("a.posting-title")?;
        let any_link_sel = selector("a[href]")?;
        let label_sel = selector("span.label")?;
        let price_sel = selector("span.priceinfo")?;
        let img_sel = selector("img")?;

        fn bind_card_link<'a, F>(f: F) -> F
        where
            F: Fn(ElementRef<'a>) -> Option<(String, ElementRef<'a>)>,
        {
            f
        }
        let card_link = bind_card_link(|card| {
            let link = card.select(&title_link_sel).next().or_else(|| {
                card.select(&any_link_sel)
                    .find(|a| a.value().attr("href").is_some_and(|h| self.id_re.is_match(h)))
            })?;
            let href = link.value().attr("href")?;
            if href.is_empty() {
                return None;
            }
            Some((absolute_url(&self.base_url, href), link))
        });

        let outcome = scan_newest_first(
            document.select(&card_sel),
            seen,
            true,
            |card| card_link(*card).map(|(url, _)| self.listing_id(&url)),
            |card, id| {
                let (url, link) = card_link(*card)?;

                let title = link
                    .select(&label_sel)
                    .next()
                    .map(element_text)
                    .filter(|t| !t.is_empty())
                    .or_else(|| Some(element_text(link)).filter(|t| !t.is_empty()))
                    .unwrap_or_else(|| "Craigslist Listing".to_string());

                let price = card
                    .select(&price_sel)
                    .next()
                    .map(element_text)
                    .filter(|p| !p.is_empty());

                // data-src carries the real image for lazy-loaded cards.
                let image_url = card.select(&img_sel).next().and_then(|img| {
                    img.value()
                        .attr("data-src")
                        .or_else(|| img.value().attr("src"))
                        .map(String::from)
                });

                Some(Listing::new(
                    id,
                    Platform::Craigslist,
                    &title,
                    price,
                    url,
                    sanitize_image_url(image_url),
                    Some(self.default_location.clone()),
                ))
            },
        );

        Ok(outcome)
    }
}

#[async_trait]
impl PlatformAdapter for CraigslistAdapter {
    fn platform(&self) -> Platform {
        Platform::Craigslist
    }

    async fn scan_term(
        &mut self,
        surface: &mut dyn BrowserSurface,
        term: &str,
        seen: &HashSet<String>,
    ) -> Result<ScanOutcome, AdapterError> {
        let mut combined = ScanOutcome::default();
        for category in &self.categories {
            let url = self.search_url(category, term)?;
            debug!(term, category, "searching craigslist");
            let page = surface.render(&url).await?;
            combined.merge(self.parse_page(&page.html, seen)?);
        }
        Ok(combined)
    }
}

// ---------------------------------------------------------------------------
// Facebook Marketplace
// ---------------------------------------------------------------------------

/// Session-access state for platforms requiring authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    ProbingAccess,
    AwaitingManualLogin,
    Authenticated,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub marketplace_url: String,
    pub login_url: String,
    pub login_timeout: Duration,
    pub poll_interval: Duration,
}

/// Detects whether marketplace content is reachable and, when it is not,
/// drives the attended manual-login fallback.
pub struct SessionManager {
    config: SessionConfig,
    state: SessionState,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn probe(&self, surface: &mut dyn BrowserSurface) -> Result<bool, RenderError> {
        let page = surface.render(&self.config.marketplace_url).await?;
        Ok(access_granted(&page))
    }

    /// Returns whether marketplace content is reachable. On a login redirect
    /// the surface is restarted attended and we block, polling, until either a
    /// follow-up probe succeeds or the timeout elapses. Timeout is not an
    /// error; the adapter simply yields nothing this cycle.
    pub async fn ensure_access(
        &mut self,
        surface: &mut dyn BrowserSurface,
    ) -> Result<bool, RenderError> {
        self.state = SessionState::ProbingAccess;
        if self.probe(surface).await? {
            self.state = SessionState::Authenticated;
            return Ok(true);
        }

        info!(
            timeout_secs = self.config.login_timeout.as_secs(),
            "marketplace unreachable; restarting attended for manual login"
        );
        self.state = SessionState::AwaitingManualLogin;
        surface.persist_session().await?;
        surface.restart(Visibility::Attended).await?;
        surface.render(&self.config.login_url).await?;

        let deadline = tokio::time::Instant::now() + self.config.login_timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.probe(surface).await {
                Ok(true) => {
                    surface.persist_session().await?;
                    self.state = SessionState::Authenticated;
                    info!("manual login confirmed");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "login probe failed"),
            }
        }

        warn!("manual login timed out");
        self.state = SessionState::Unauthenticated;
        Ok(false)
    }
}

fn access_granted(page: &RenderedPage) -> bool {
    let url = page.final_url.to_ascii_lowercase();
    if url.contains("/login") || url.contains("checkpoint") {
        return false;
    }
    if url.contains("/marketplace") {
        return true;
    }
    page.html.contains("/marketplace/item/")
}

/// Facebook Marketplace adapter.
///
/// Facebook ignores the `sortBy` request parameter, so early-stop is applied
/// only after the surface confirms newest-first ordering took effect.
pub struct FacebookAdapter {
    marketplace_url: String,
    min_price: u32,
    max_price: u32,
    default_location: String,
    id_re: Regex,
    session: SessionManager,
}

impl FacebookAdapter {
    pub fn new(config: &MonitorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            marketplace_url: config.facebook.marketplace_url.clone(),
            min_price: config.min_price,
            max_price: config.max_price,
            default_location: format!("{} area", config.location.default_label),
            id_re: Regex::new(r"/marketplace/item/(\d+)")?,
            session: SessionManager::new(SessionConfig {
                marketplace_url: config.facebook.marketplace_url.clone(),
                login_url: config.facebook.login_url.clone(),
                login_timeout: config.facebook.login_timeout,
                poll_interval: config.facebook.login_poll_interval,
            }),
        })
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn search_url(&self, term: &str) -> Result<String, AdapterError> {
        let url = Url::parse_with_params(
            &format!("{}/search", self.marketplace_url.trim_end_matches('/')),
            [
                ("query", term),
                ("minPrice", &self.min_price.to_string()),
                ("maxPrice", &self.max_price.to_string()),
                ("daysSinceListed", "7"),
                ("sortBy", "creation_date_descend"),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("building facebook search url: {e}")))?;
        Ok(url.to_string())
    }

    fn listing_id(&self, href: &str) -> Option<String> {
        self.id_re
            .captures(href)
            .and_then(|c| c.get(1))
            .map(|native| format!("fb_{}", native.as_str()))
    }

    fn parse_page(
        &self,
        html: &str,
        seen: &HashSet<String>,
        early_stop: bool,
    ) -> Result<ScanOutcome, AdapterError> {
        let document = Html::parse_document(html);
        let link_sel = selector("a[href]")?;
        let span_sel = selector("span")?;
        let img_sel = selector("img")?;

        let item_links = document
            .select(&link_sel)
            .filter(|a| {
                a.value()
                    .attr("href")
                    .is_some_and(|h| h.contains("/marketplace/item/"))
            })
            .collect::<Vec<_>>();

        let outcome = scan_newest_first(
            item_links,
            seen,
            early_stop,
            |link| self.listing_id(link.value().attr("href")?),
            |link, id| {
                let href = link.value().attr("href")?;
                let url = absolute_url("https://www.facebook.com", href);

                // The card is the nearest div ancestor; its spans carry title,
                // price and location in no fixed structure.
                let card = link
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .find(|e| e.value().name() == "div");

                let mut title = String::new();
                let mut price = None;
                let mut location = None;
                let mut image_url = None;

                if let Some(card) = card {
                    for span in card.select(&span_sel) {
                        let text = element_text(span);
                        if text.is_empty() {
                            continue;
                        }
                        if text.starts_with('$') || text.contains("Free") {
                            price.get_or_insert(text);
                        } else if location.is_none() && text.contains(',') && text.len() < 50 {
                            location = Some(text);
                        } else if text.chars().count() > 10 && text.chars().count() > title.chars().count() {
                            title = text;
                        }
                    }
                    image_url = card
                        .select(&img_sel)
                        .next()
                        .and_then(|img| img.value().attr("src").map(String::from));
                }

                if title.is_empty() {
                    title = "Facebook Listing".to_string();
                }

                let title_lower = title.to_ascii_lowercase();
                if !FURNITURE_KEYWORDS.iter().any(|kw| title_lower.contains(kw)) {
                    debug!(%id, title, "discarded non-furniture listing");
                    return None;
                }

                Some(Listing::new(
                    id,
                    Platform::Facebook,
                    &title,
                    price,
                    url,
                    sanitize_image_url(image_url),
                    location.or_else(|| Some(self.default_location.clone())),
                ))
            },
        );

        Ok(outcome)
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn prepare(&mut self, surface: &mut dyn BrowserSurface) -> Result<bool, AdapterError> {
        Ok(self.session.ensure_access(surface).await?)
    }

    async fn scan_term(
        &mut self,
        surface: &mut dyn BrowserSurface,
        term: &str,
        seen: &HashSet<String>,
    ) -> Result<ScanOutcome, AdapterError> {
        let url = self.search_url(term)?;
        debug!(term, "searching facebook marketplace");
        let page = surface.render(&url).await?;

        // Sorting rewrites the results in place; only the post-sort markup is
        // safe to early-stop on.
        match surface.ensure_newest_first().await? {
            Some(sorted) => self.parse_page(&sorted.html, seen, true),
            None => {
                debug!(term, "newest-first ordering not verified; scanning full page");
                self.parse_page(&page.html, seen, false)
            }
        }
    }
}
