//! Monitoring orchestration: the acquisition engine and the polling loop.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use couchwatch_adapters::{BrowserSurface, PlatformAdapter};
use couchwatch_core::{Listing, MonitorConfig};
use couchwatch_notify::{Dispatcher, WebhookTransport};
use couchwatch_storage::SeenStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "couchwatch-monitor";

/// How often the retention sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs every search term against one adapter and merges the results.
///
/// A term that fails is logged and skipped; the remaining terms still run.
/// Listings surfaced by more than one term in the same cycle are kept once,
/// in the order they first appeared.
pub struct AcquisitionEngine {
    terms: Vec<String>,
    term_pacing: Duration,
}

impl AcquisitionEngine {
    pub fn new(terms: Vec<String>, term_pacing: Duration) -> Self {
        Self { terms, term_pacing }
    }

    pub async fn run(
        &self,
        adapter: &mut dyn PlatformAdapter,
        surface: &mut dyn BrowserSurface,
        seen: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Vec<Listing> {
        let platform = adapter.platform();
        let mut accepted: HashSet<String> = HashSet::new();
        let mut listings: Vec<Listing> = Vec::new();

        for (index, term) in self.terms.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if index > 0 && !self.term_pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.term_pacing) => {}
                }
            }

            match adapter.scan_term(surface, term, seen).await {
                Ok(outcome) => {
                    for listing in outcome.listings {
                        if accepted.insert(listing.id.clone()) {
                            listings.push(listing);
                        }
                    }
                }
                Err(err) => {
                    warn!(%platform, term, error = %err, "term scan failed; continuing");
                }
            }
        }

        listings
    }
}

/// One adapter paired with the surface that renders its pages.
pub struct MonitoredPlatform {
    pub adapter: Box<dyn PlatformAdapter>,
    pub surface: Box<dyn BrowserSurface>,
}

/// The long-running polling loop tying adapters, storage and notifications
/// together.
pub struct Monitor<T: WebhookTransport> {
    store: SeenStore,
    dispatcher: Dispatcher<T>,
    platforms: Vec<MonitoredPlatform>,
    engine: AcquisitionEngine,
    config: MonitorConfig,
    cleanup_due: tokio::time::Instant,
    check_count: u64,
}

impl<T: WebhookTransport> Monitor<T> {
    pub fn new(
        store: SeenStore,
        dispatcher: Dispatcher<T>,
        platforms: Vec<MonitoredPlatform>,
        config: MonitorConfig,
    ) -> Self {
        let engine = AcquisitionEngine::new(config.search_terms.clone(), config.term_pacing);
        Self {
            store,
            dispatcher,
            platforms,
            engine,
            config,
            cleanup_due: tokio::time::Instant::now() + CLEANUP_INTERVAL,
            check_count: 0,
        }
    }

    /// Poll until cancelled. Storage failures are fatal; everything else is
    /// contained per platform or per term. On a fatal error a crash
    /// notification goes out best-effort before teardown.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            terms = ?self.config.search_terms,
            interval_secs = self.config.check_interval.as_secs(),
            "monitor starting"
        );
        self.dispatcher.verify_destinations().await;
        self.dispatcher
            .announce_startup(
                &self.config.search_terms,
                self.config.min_price,
                self.config.max_price,
            )
            .await;

        let outcome = self.poll_loop(&cancel).await;
        if let Err(err) = &outcome {
            error!(error = ?err, "monitor crashed");
            self.dispatcher.announce_error(&format!("{err:#}")).await;
        }
        self.teardown().await;
        outcome
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                info!("shutdown requested");
                return Ok(());
            }

            self.cycle(cancel).await?;

            if tokio::time::Instant::now() >= self.cleanup_due {
                let removed = self
                    .store
                    .prune_older_than(self.config.retention_days)
                    .await
                    .context("pruning expired listings")?;
                info!(removed, days = self.config.retention_days, "retention sweep");
                self.cleanup_due = tokio::time::Instant::now() + CLEANUP_INTERVAL;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
    }

    /// One pass over every platform. Returns the number of new listings.
    pub async fn cycle(&mut self, cancel: &CancellationToken) -> anyhow::Result<usize> {
        self.check_count += 1;
        let mut total_new = 0;

        for entry in &mut self.platforms {
            if cancel.is_cancelled() {
                break;
            }
            let platform = entry.adapter.platform();

            let seen = self
                .store
                .seen_ids(Some(platform))
                .await
                .with_context(|| format!("loading seen ids for {platform}"))?;

            match entry.adapter.prepare(entry.surface.as_mut()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%platform, "platform unreachable; skipping this cycle");
                    continue;
                }
                Err(err) => {
                    warn!(%platform, error = %err, "platform preparation failed; skipping");
                    continue;
                }
            }

            let fresh = self
                .engine
                .run(entry.adapter.as_mut(), entry.surface.as_mut(), &seen, cancel)
                .await;

            if fresh.is_empty() {
                continue;
            }

            let delivered = self.dispatcher.dispatch(&fresh).await;
            let inserted = self
                .store
                .insert_new(&fresh)
                .await
                .with_context(|| format!("persisting listings for {platform}"))?;
            info!(%platform, found = fresh.len(), delivered, inserted, "cycle results");
            total_new += inserted;
        }

        let counts = self
            .store
            .counts_by_platform()
            .await
            .context("collecting tracking counts")?;
        info!(check = self.check_count, new = total_new, ?counts, "cycle complete");

        Ok(total_new)
    }

    /// Flush whatever session state the surfaces hold; best effort.
    async fn teardown(&mut self) {
        for entry in &mut self.platforms {
            if let Err(err) = entry.surface.persist_session().await {
                warn!(error = %err, "session persistence failed during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use couchwatch_adapters::{
        scan_newest_first, AdapterError, RenderError, RenderedPage, ScanOutcome, Visibility,
    };
    use couchwatch_core::{Platform, WebhookConfig};
    use couchwatch_notify::{DispatcherConfig, TransportError, WebhookReply};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NullSurface;

    #[async_trait]
    impl BrowserSurface for NullSurface {
        async fn render(&mut self, url: &str) -> Result<RenderedPage, RenderError> {
            Ok(RenderedPage {
                final_url: url.to_string(),
                html: String::new(),
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

    fn listing(id: &str) -> Listing {
        Listing::new(
            id.to_string(),
            Platform::Craigslist,
            &format!("Sectional {id}"),
            Some("$250".to_string()),
            format!("https://example.org/{id}.html"),
            None,
            None,
        )
    }

    /// Serves a fixed newest-first page for every term, running the same
    /// ordered scan the real adapters use.
    struct PageAdapter {
        page: Vec<&'static str>,
        reachable: bool,
        failing_terms: Vec<&'static str>,
    }

    impl PageAdapter {
        fn new(page: Vec<&'static str>) -> Self {
            Self {
                page,
                reachable: true,
                failing_terms: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for PageAdapter {
        fn platform(&self) -> Platform {
            Platform::Craigslist
        }

        async fn prepare(
            &mut self,
            _surface: &mut dyn BrowserSurface,
        ) -> Result<bool, AdapterError> {
            Ok(self.reachable)
        }

        async fn scan_term(
            &mut self,
            _surface: &mut dyn BrowserSurface,
            term: &str,
            seen: &HashSet<String>,
        ) -> Result<ScanOutcome, AdapterError> {
            if self.failing_terms.contains(&term) {
                return Err(AdapterError::Message(format!("term {term} exploded")));
            }
            Ok(scan_newest_first(
                self.page.iter().copied(),
                seen,
                true,
                |id| Some(id.to_string()),
                |id, _| Some(listing(id)),
            ))
        }
    }

    struct CountingTransport {
        batches: AtomicUsize,
        delivered_titles: Mutex<Vec<String>>,
        fail_all: bool,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                batches: AtomicUsize::new(0),
                delivered_titles: Mutex::new(Vec::new()),
                fail_all: false,
            }
        }
    }

    #[async_trait]
    impl WebhookTransport for CountingTransport {
        async fn execute(
            &self,
            _destination: &str,
            payload: &serde_json::Value,
        ) -> Result<WebhookReply, TransportError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Ok(WebhookReply::Rejected {
                    status: 400,
                    body: "nope".into(),
                });
            }
            if let Some(embeds) = payload["embeds"].as_array() {
                let mut titles = self.delivered_titles.lock().unwrap();
                for embed in embeds {
                    if let Some(t) = embed["title"].as_str() {
                        titles.push(t.to_string());
                    }
                }
            }
            Ok(WebhookReply::Delivered)
        }

        async fn probe(&self, _destination: &str) -> Result<bool, TransportError> {
            Ok(true)
        }
    }

    fn test_config() -> MonitorConfig {
        let mut config = MonitorConfig::from_env();
        config.search_terms = vec!["sectional".to_string(), "modular sofa".to_string()];
        config.term_pacing = Duration::ZERO;
        config.check_interval = Duration::from_millis(5);
        config
    }

    fn test_dispatcher(transport: CountingTransport) -> Dispatcher<CountingTransport> {
        let mut config = DispatcherConfig::new(WebhookConfig {
            craigslist_url: Some("https://hooks.example/cl".into()),
            facebook_url: None,
            default_url: None,
        });
        config.batch_pacing = Duration::ZERO;
        Dispatcher::new(transport, config)
    }

    async fn memory_store() -> SeenStore {
        let store = SeenStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn engine_deduplicates_across_terms() {
        let engine = AcquisitionEngine::new(
            vec!["sectional".into(), "couch".into()],
            Duration::ZERO,
        );
        let mut adapter = PageAdapter::new(vec!["cl_3", "cl_2", "cl_1"]);
        let mut surface = NullSurface;
        let cancel = CancellationToken::new();

        let listings = engine
            .run(&mut adapter, &mut surface, &HashSet::new(), &cancel)
            .await;

        // Both terms return the same page; each listing survives once.
        let ids: Vec<&str> = listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["cl_3", "cl_2", "cl_1"]);
    }

    #[tokio::test]
    async fn engine_isolates_failing_terms() {
        let engine = AcquisitionEngine::new(
            vec!["sectional".into(), "couch".into()],
            Duration::ZERO,
        );
        let mut adapter = PageAdapter::new(vec!["cl_1"]);
        adapter.failing_terms = vec!["sectional"];
        let mut surface = NullSurface;
        let cancel = CancellationToken::new();

        let listings = engine
            .run(&mut adapter, &mut surface, &HashSet::new(), &cancel)
            .await;
        assert_eq!(listings.len(), 1);
    }

    #[tokio::test]
    async fn cycle_notifies_and_persists_only_unseen_listings() {
        let store = memory_store().await;
        store
            .insert_new(&[listing("cl_1"), listing("cl_2")])
            .await
            .unwrap();

        let mut monitor = Monitor::new(
            store,
            test_dispatcher(CountingTransport::new()),
            vec![MonitoredPlatform {
                adapter: Box::new(PageAdapter::new(vec!["cl_3", "cl_2", "cl_1"])),
                surface: Box::new(NullSurface),
            }],
            test_config(),
        );

        let new = monitor.cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(new, 1);

        let titles = monitor
            .dispatcher
            .transport()
            .delivered_titles
            .lock()
            .unwrap()
            .clone();
        assert_eq!(titles, vec!["Sectional cl_3"]);

        let seen = monitor.store.seen_ids(None).await.unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains("cl_3"));
    }

    #[tokio::test]
    async fn cycle_persists_even_when_delivery_fails() {
        let store = memory_store().await;
        let mut transport = CountingTransport::new();
        transport.fail_all = true;

        let mut monitor = Monitor::new(
            store,
            test_dispatcher(transport),
            vec![MonitoredPlatform {
                adapter: Box::new(PageAdapter::new(vec!["cl_1"])),
                surface: Box::new(NullSurface),
            }],
            test_config(),
        );

        let new = monitor.cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(new, 1);
        assert!(monitor.store.seen_ids(None).await.unwrap().contains("cl_1"));
    }

    #[tokio::test]
    async fn unreachable_platform_is_skipped_without_error() {
        let store = memory_store().await;
        let mut adapter = PageAdapter::new(vec!["cl_1"]);
        adapter.reachable = false;

        let mut monitor = Monitor::new(
            store,
            test_dispatcher(CountingTransport::new()),
            vec![MonitoredPlatform {
                adapter: Box::new(adapter),
                surface: Box::new(NullSurface),
            }],
            test_config(),
        );

        let new = monitor.cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(
            monitor.dispatcher.transport().batches.load(Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn run_announces_and_stops_on_cancellation() {
        let store = memory_store().await;
        let mut monitor = Monitor::new(
            store,
            test_dispatcher(CountingTransport::new()),
            vec![MonitoredPlatform {
                adapter: Box::new(PageAdapter::new(vec!["cl_1"])),
                surface: Box::new(NullSurface),
            }],
            test_config(),
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome = monitor.run(cancel).await;
        assert!(outcome.is_ok());
        handle.await.unwrap();
        // One startup announcement plus at least one delivery batch.
        assert!(monitor.dispatcher.transport().batches.load(Ordering::SeqCst) >= 2);
    }
}
