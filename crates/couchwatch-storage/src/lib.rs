//! Durable seen-listing store + HTTP fetch utilities for Couchwatch.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use couchwatch_core::{Listing, Platform};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "couchwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Durable mapping of listing id to platform and first-seen timestamp.
///
/// Grows monotonically except for pruning. Inserting an already-present id is a
/// no-op that never updates `first_seen`.
#[derive(Debug, Clone)]
pub struct SeenStore {
    pool: SqlitePool,
}

impl SeenStore {
    /// Open (creating if missing) the store at `database_url`, e.g.
    /// `sqlite:couchwatch.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        // A single connection keeps in-memory databases stable and matches the
        // strictly sequential access pattern of the polling loop.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                title TEXT NOT NULL,
                price TEXT,
                url TEXT NOT NULL,
                image_url TEXT,
                location TEXT,
                first_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_platform ON listings(platform)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_first_seen ON listings(first_seen)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids already recorded, optionally filtered to one platform.
    pub async fn seen_ids(&self, platform: Option<Platform>) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = match platform {
            Some(platform) => {
                sqlx::query_scalar("SELECT id FROM listings WHERE platform = ?")
                    .bind(platform.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM listings")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(ids.into_iter().collect())
    }

    /// Insert listings that are not yet present; duplicates are skipped without
    /// touching the stored row. Returns the number of newly stored listings.
    /// `first_seen` is assigned here, at persistence time.
    pub async fn insert_new(&self, listings: &[Listing]) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut stored = 0usize;
        for listing in listings {
            let result = sqlx::query(
                r#"
                INSERT INTO listings (id, platform, title, price, url, image_url, location, first_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&listing.id)
            .bind(listing.platform.as_str())
            .bind(&listing.title)
            .bind(&listing.price)
            .bind(&listing.url)
            .bind(&listing.image_url)
            .bind(&listing.location)
            .bind(now)
            .execute(&self.pool)
            .await?;
            stored += result.rows_affected() as usize;
        }
        Ok(stored)
    }

    pub async fn first_seen(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let first_seen = sqlx::query_scalar("SELECT first_seen FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(first_seen)
    }

    /// Remove listings first seen more than `days` ago. Returns the number of
    /// rows removed; zero eligible rows is a no-op.
    pub async fn prune_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query("DELETE FROM listings WHERE first_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Listing counts grouped by platform, for the per-cycle summary log.
    pub async fn counts_by_platform(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT platform, COUNT(*) FROM listings GROUP BY platform ORDER BY platform",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[cfg(test)]
    async fn backdate(&self, id: &str, first_seen: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE listings SET first_seen = ? WHERE id = ?")
            .bind(first_seen)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain HTTP page fetcher with retry-on-transient-failure.
///
/// Requests are strictly sequential in the polling model, so there is no
/// concurrency limiting here, only timeout and backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, platform: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            debug!(platform, url, attempt, "http fetch");
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, platform: Platform) -> Listing {
        Listing::new(
            id.to_string(),
            platform,
            "Gray sectional with chaise",
            Some("$450".to_string()),
            format!("https://example.org/{id}.html"),
            None,
            Some("Columbus, OH".to_string()),
        )
    }

    async fn memory_store() -> SeenStore {
        let store = SeenStore::connect("sqlite::memory:").await.expect("connect");
        store.ensure_schema().await.expect("schema");
        store
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_noop_and_keeps_first_seen() {
        let store = memory_store().await;
        let first = store
            .insert_new(&[listing("cl_100", Platform::Craigslist)])
            .await
            .expect("insert");
        assert_eq!(first, 1);

        let original = store
            .first_seen("cl_100")
            .await
            .expect("query")
            .expect("row exists");

        let mut changed = listing("cl_100", Platform::Craigslist);
        changed.title = "Completely different title".to_string();
        let second = store.insert_new(&[changed]).await.expect("insert again");
        assert_eq!(second, 0);

        let after = store
            .first_seen("cl_100")
            .await
            .expect("query")
            .expect("row still exists");
        assert_eq!(original, after);
    }

    #[tokio::test]
    async fn seen_ids_filters_by_platform() {
        let store = memory_store().await;
        store
            .insert_new(&[
                listing("cl_1", Platform::Craigslist),
                listing("fb_1", Platform::Facebook),
                listing("fb_2", Platform::Facebook),
            ])
            .await
            .expect("insert");

        let facebook = store.seen_ids(Some(Platform::Facebook)).await.expect("ids");
        assert_eq!(facebook.len(), 2);
        assert!(facebook.contains("fb_1"));
        assert!(!facebook.contains("cl_1"));

        let all = store.seen_ids(None).await.expect("ids");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn pruning_removes_only_rows_past_retention() {
        let store = memory_store().await;
        store
            .insert_new(&[
                listing("cl_old", Platform::Craigslist),
                listing("cl_fresh", Platform::Craigslist),
            ])
            .await
            .expect("insert");
        store
            .backdate("cl_old", Utc::now() - chrono::Duration::days(10))
            .await
            .expect("backdate");

        let removed = store.prune_older_than(7).await.expect("prune");
        assert_eq!(removed, 1);

        let ids = store.seen_ids(None).await.expect("ids");
        assert!(ids.contains("cl_fresh"));
        assert!(!ids.contains("cl_old"));

        // Nothing else eligible: a second run is a no-op.
        let removed = store.prune_older_than(7).await.expect("prune again");
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn counts_group_by_platform() {
        let store = memory_store().await;
        store
            .insert_new(&[
                listing("cl_1", Platform::Craigslist),
                listing("fb_1", Platform::Facebook),
                listing("fb_2", Platform::Facebook),
            ])
            .await
            .expect("insert");

        let counts = store.counts_by_platform().await.expect("counts");
        assert_eq!(
            counts,
            vec![("craigslist".to_string(), 1), ("facebook".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn store_survives_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}", dir.path().join("seen.db").display());

        {
            let store = SeenStore::connect(&url).await.expect("connect");
            store.ensure_schema().await.expect("schema");
            store
                .insert_new(&[listing("fb_77", Platform::Facebook)])
                .await
                .expect("insert");
        }

        let reopened = SeenStore::connect(&url).await.expect("reconnect");
        reopened.ensure_schema().await.expect("schema");
        let ids = reopened.seen_ids(Some(Platform::Facebook)).await.expect("ids");
        assert!(ids.contains("fb_77"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_status_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
    }
}
