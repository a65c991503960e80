//! Persisted address/finding stores and the proxied HTTP client for onionwatch.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onionwatch_core::{
    AddressRecord, AddressStatus, CheckOutcome, CheckResult, DeadReason, FilteredFinding,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "onionwatch-storage";

pub const DEFAULT_PROXY_URL: &str = "socks5h://127.0.0.1:9050";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding matched keywords: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt row for {address}: {detail}")]
    Corrupt { address: String, detail: String },
}

/// Whether a finding write created a row or merged into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingWrite {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub alive: u64,
    pub dead: u64,
}

/// Address store contract. Each mutating call is atomic for the record(s) it touches.
#[async_trait]
pub trait AddressStore: Send + Sync {
    /// Insert addresses not yet known as unverified (`dead`, never seen, never checked).
    /// Returns how many were new.
    async fn insert_unverified(&self, addresses: &[String]) -> Result<usize, StoreError>;

    /// Addresses never checked or last checked strictly before `cutoff`.
    async fn due_for_check(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Apply one liveness outcome. Returns false when the address is not stored.
    async fn record_check(&self, outcome: &CheckOutcome) -> Result<bool, StoreError>;

    /// Delete dead records never seen alive or last seen before `cutoff`.
    async fn sweep_dead(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn alive_addresses(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, address: &str) -> Result<Option<AddressRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<AddressRecord>, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}

/// Filtered store contract.
#[async_trait]
pub trait FindingStore: Send + Sync {
    /// Insert a finding or merge it into the existing one for the same address.
    async fn record_finding(&self, finding: &FilteredFinding) -> Result<FindingWrite, StoreError>;

    async fn finding_for(&self, address: &str) -> Result<Option<FilteredFinding>, StoreError>;

    async fn list_findings(&self) -> Result<Vec<FilteredFinding>, StoreError>;
}

const ADDRESS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS addresses (
    address      TEXT PRIMARY KEY NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('alive', 'dead')),
    last_seen    INTEGER,
    last_checked INTEGER
)
"#;

const FINDING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS findings (
    address          TEXT PRIMARY KEY NOT NULL,
    title            TEXT NOT NULL,
    matched_keywords TEXT NOT NULL,
    context_snippet  TEXT NOT NULL,
    first_matched_at INTEGER NOT NULL,
    last_matched_at  INTEGER NOT NULL
)
"#;

/// SQLite-backed implementation of both stores. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Opens an existing database without creating it or touching its schema.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .read_only(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, kept alive on a single pooled connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(ADDRESS_SCHEMA).execute(&self.pool).await?;
        sqlx::query(FINDING_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(address: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        address: address.to_string(),
        detail: format!("timestamp {ms} out of range"),
    })
}

fn opt_from_millis(address: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|v| from_millis(address, v)).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<AddressRecord, StoreError> {
    let address: String = row.try_get("address")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<AddressStatus>()
        .map_err(|e| StoreError::Corrupt {
            address: address.clone(),
            detail: e.to_string(),
        })?;
    let last_seen = opt_from_millis(&address, row.try_get("last_seen")?)?;
    let last_checked = opt_from_millis(&address, row.try_get("last_checked")?)?;
    Ok(AddressRecord {
        address,
        status,
        last_seen,
        last_checked,
    })
}

fn finding_from_row(row: &SqliteRow) -> Result<FilteredFinding, StoreError> {
    let address: String = row.try_get("address")?;
    let encoded: String = row.try_get("matched_keywords")?;
    let matched_keywords: Vec<String> =
        serde_json::from_str(&encoded).map_err(|e| StoreError::Corrupt {
            address: address.clone(),
            detail: format!("matched_keywords: {e}"),
        })?;
    let first_matched_at = from_millis(&address, row.try_get("first_matched_at")?)?;
    let last_matched_at = from_millis(&address, row.try_get("last_matched_at")?)?;
    Ok(FilteredFinding {
        title: row.try_get("title")?,
        context_snippet: row.try_get("context_snippet")?,
        address,
        matched_keywords,
        first_matched_at,
        last_matched_at,
    })
}

#[async_trait]
impl AddressStore for SqliteStore {
    async fn insert_unverified(&self, addresses: &[String]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for address in addresses {
            let result = sqlx::query(
                r#"
                INSERT INTO addresses (address, status, last_seen, last_checked)
                VALUES (?, 'dead', NULL, NULL)
                ON CONFLICT(address) DO NOTHING
                "#,
            )
            .bind(address)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn due_for_check(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address
              FROM addresses
             WHERE last_checked IS NULL
                OR last_checked < ?
             ORDER BY address
            "#,
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("address").map_err(StoreError::from))
            .collect()
    }

    async fn record_check(&self, outcome: &CheckOutcome) -> Result<bool, StoreError> {
        let at = to_millis(outcome.checked_at);
        let query = match outcome.result {
            CheckResult::Alive { .. } => sqlx::query(
                "UPDATE addresses SET status = 'alive', last_seen = ?, last_checked = ? WHERE address = ?",
            )
            .bind(at)
            .bind(at),
            CheckResult::Dead(_) => {
                sqlx::query("UPDATE addresses SET status = 'dead', last_checked = ? WHERE address = ?")
                    .bind(at)
            }
        };
        let result = query.bind(&outcome.address).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_dead(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM addresses
             WHERE status = 'dead'
               AND (last_seen IS NULL OR last_seen < ?)
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn alive_addresses(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT address FROM addresses WHERE status = 'alive' ORDER BY address")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("address").map_err(StoreError::from))
            .collect()
    }

    async fn get(&self, address: &str) -> Result<Option<AddressRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT address, status, last_seen, last_checked FROM addresses WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<AddressRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT address, status, last_seen, last_checked FROM addresses ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status = 'alive' THEN 1 ELSE 0 END), 0) AS alive,
                   COALESCE(SUM(CASE WHEN status = 'dead' THEN 1 ELSE 0 END), 0) AS dead
              FROM addresses
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let alive: i64 = row.try_get("alive")?;
        let dead: i64 = row.try_get("dead")?;
        Ok(StatusCounts {
            alive: alive.max(0) as u64,
            dead: dead.max(0) as u64,
        })
    }
}

#[async_trait]
impl FindingStore for SqliteStore {
    async fn record_finding(&self, finding: &FilteredFinding) -> Result<FindingWrite, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            r#"
            SELECT address, title, matched_keywords, context_snippet, first_matched_at, last_matched_at
              FROM findings
             WHERE address = ?
            "#,
        )
        .bind(&finding.address)
        .fetch_optional(&mut *tx)
        .await?;

        let (merged, write) = match existing.as_ref().map(finding_from_row).transpose()? {
            Some(previous) => (previous.merge(finding.clone()), FindingWrite::Merged),
            None => (finding.clone(), FindingWrite::Inserted),
        };

        sqlx::query(
            r#"
            INSERT INTO findings
                (address, title, matched_keywords, context_snippet, first_matched_at, last_matched_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                title = excluded.title,
                matched_keywords = excluded.matched_keywords,
                context_snippet = excluded.context_snippet,
                first_matched_at = excluded.first_matched_at,
                last_matched_at = excluded.last_matched_at
            "#,
        )
        .bind(&merged.address)
        .bind(&merged.title)
        .bind(serde_json::to_string(&merged.matched_keywords)?)
        .bind(&merged.context_snippet)
        .bind(to_millis(merged.first_matched_at))
        .bind(to_millis(merged.last_matched_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(write)
    }

    async fn finding_for(&self, address: &str) -> Result<Option<FilteredFinding>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT address, title, matched_keywords, context_snippet, first_matched_at, last_matched_at
              FROM findings
             WHERE address = ?
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(finding_from_row).transpose()
    }

    async fn list_findings(&self) -> Result<Vec<FilteredFinding>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, title, matched_keywords, context_snippet, first_matched_at, last_matched_at
              FROM findings
             ORDER BY address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(finding_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy_probe_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub max_body_bytes: usize,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            proxy_probe_timeout: Duration::from_secs(3),
            user_agent: None,
            global_concurrency: 16,
            max_body_bytes: 5 * 1024 * 1024,
            accept_invalid_certs: true,
        }
    }
}

/// Host and port of the local SOCKS endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn parse(proxy_url: &str) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(proxy_url)
            .with_context(|| format!("parsing proxy url {proxy_url}"))?;
        match url.scheme() {
            "socks5h" => {}
            "socks5" => warn!(
                proxy = proxy_url,
                "socks5 resolves hostnames locally; onion addresses need socks5h"
            ),
            other => anyhow::bail!("proxy scheme {other} is not supported; use socks5h://"),
        }
        let host = url
            .host_str()
            .with_context(|| format!("proxy url {proxy_url} has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Ok(Self {
            url: proxy_url.to_string(),
            host,
            port: url.port().unwrap_or(1080),
        })
    }
}

/// Response head of a liveness probe. The body is never read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub final_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("proxy {proxy} unavailable: {detail}")]
    ProxyUnavailable { proxy: String, detail: String },
    #[error("{url} unreachable: {detail}")]
    Unreachable { url: String, detail: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading body of {url}: {detail}")]
    Body { url: String, detail: String },
}

impl FetchError {
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, FetchError::ProxyUnavailable { .. })
    }

    /// How a failed liveness probe is recorded.
    pub fn dead_reason(&self) -> DeadReason {
        match self {
            FetchError::Timeout { .. } => DeadReason::Timeout,
            FetchError::ProxyUnavailable { detail, .. } => DeadReason::ProxyUnavailable(detail.clone()),
            other => DeadReason::Unreachable(other.to_string()),
        }
    }
}

/// Outbound traffic seam: everything the pipeline sends goes through an implementation of this.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    /// Connect and complete an HTTP exchange; any status counts as a response.
    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError>;

    /// Fetch a page body; non-success statuses are errors.
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;

    /// Whether the proxy endpoint itself accepts connections.
    async fn proxy_reachable(&self) -> bool;

    fn proxy_label(&self) -> String;
}

/// `reqwest` client routed through the SOCKS proxy, with a global in-flight cap.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    proxy: ProxyEndpoint,
    global_limit: Arc<Semaphore>,
    proxy_probe_timeout: Duration,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let proxy = ProxyEndpoint::parse(&config.proxy_url)?;
        let mut builder = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(&config.proxy_url).context("configuring socks proxy")?)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            proxy,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            proxy_probe_timeout: config.proxy_probe_timeout,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }

    pub fn proxy(&self) -> &ProxyEndpoint {
        &self.proxy
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        match self.client.get(url).send().await {
            Ok(resp) => Ok(resp),
            Err(err) => Err(self.classify(url, err).await),
        }
    }

    async fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout {
                url: url.to_string(),
            };
        }
        let detail = error_chain(&err);
        if (err.is_connect() || err.is_request()) && !self.proxy_reachable().await {
            return FetchError::ProxyUnavailable {
                proxy: self.proxy.url.clone(),
                detail,
            };
        }
        FetchError::Unreachable {
            url: url.to_string(),
            detail,
        }
    }

    async fn probe_inner(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let resp = self.send(url).await?;
        let status = resp.status().as_u16();
        debug!(status, "probe answered");
        Ok(ProbeResponse {
            status,
            final_url: resp.url().to_string(),
        })
    }

    async fn fetch_page_inner(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.send(url).await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let (body, truncated) = self.read_body(&final_url, resp).await?;
        if truncated {
            debug!(limit = self.max_body_bytes, "body truncated");
        }
        Ok(FetchedPage {
            status: status.as_u16(),
            final_url,
            content_type,
            body,
            truncated,
        })
    }

    async fn read_body(&self, url: &str, mut resp: reqwest::Response) -> Result<(String, bool), FetchError> {
        let mut bytes = Vec::new();
        let mut truncated = false;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.max_body_bytes - bytes.len();
                    if chunk.len() >= room {
                        bytes.extend_from_slice(&chunk[..room]);
                        truncated = chunk.len() > room;
                        break;
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) if err.is_timeout() => {
                    return Err(FetchError::Timeout {
                        url: url.to_string(),
                    })
                }
                Err(err) => {
                    return Err(FetchError::Body {
                        url: url.to_string(),
                        detail: error_chain(&err),
                    })
                }
            }
        }
        Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
    }
}

#[async_trait]
impl OverlayClient for HttpFetcher {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        self.probe_inner(url)
            .instrument(info_span!("http_probe", url))
            .await
    }

    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        self.fetch_page_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn proxy_reachable(&self) -> bool {
        let connect = TcpStream::connect((self.proxy.host.as_str(), self.proxy.port));
        matches!(
            tokio::time::timeout(self.proxy_probe_timeout, connect).await,
            Ok(Ok(_))
        )
    }

    fn proxy_label(&self) -> String {
        self.proxy.url.clone()
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
        source = inner.source();
    }
    parts.join(": ")
}
