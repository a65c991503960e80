//! Fetch, verify, sweep and filter orchestration.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use onionwatch_core::{AddressStatus, CheckOutcome, FilteredFinding, SignalConfig};
use onionwatch_extract::{
    address_url, extract_onion_addresses, normalize_address, ExtractError, ParsedPage,
    SignalMatcher, SnippetWindow,
};
use onionwatch_storage::{
    AddressStore, FetchError, FindingStore, FindingWrite, HttpClientConfig, HttpFetcher,
    OverlayClient, SqliteStore, StatusCounts, StoreError, DEFAULT_PROXY_URL,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "onionwatch-pipeline";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (onionwatch/0.1)";
pub const DEFAULT_EXIT_PROBE_URL: &str = "http://httpbin.org/ip";

// Roughly a century; keeps `now - cooldown` inside chrono's range.
const MAX_COOLDOWN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub config_path: PathBuf,
    pub address_db: PathBuf,
    pub findings_db: PathBuf,
    pub proxy_url: String,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub run_deadline_secs: Option<u64>,
    pub recheck_cooldown_secs: u64,
    pub user_agent: String,
    pub exit_probe_url: String,
    pub snippet: SnippetWindow,
    pub progress_every: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            address_db: PathBuf::from("onion_links.db"),
            findings_db: PathBuf::from("filtered_onions.db"),
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            workers: 16,
            http_timeout_secs: 30,
            run_deadline_secs: None,
            recheck_cooldown_secs: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            exit_probe_url: DEFAULT_EXIT_PROBE_URL.to_string(),
            snippet: SnippetWindow::default(),
            progress_every: 100,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: std::env::var("ONIONWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            address_db: std::env::var("ONIONWATCH_ADDRESS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.address_db),
            findings_db: std::env::var("ONIONWATCH_FINDINGS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.findings_db),
            proxy_url: std::env::var("ONIONWATCH_PROXY").unwrap_or(defaults.proxy_url),
            workers: env_parse("ONIONWATCH_WORKERS").unwrap_or(defaults.workers),
            http_timeout_secs: env_parse("ONIONWATCH_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            run_deadline_secs: env_parse("ONIONWATCH_DEADLINE_SECS"),
            recheck_cooldown_secs: env_parse("ONIONWATCH_RECHECK_COOLDOWN_SECS")
                .unwrap_or(defaults.recheck_cooldown_secs),
            user_agent: std::env::var("ONIONWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            exit_probe_url: std::env::var("ONIONWATCH_EXIT_PROBE_URL")
                .unwrap_or(defaults.exit_probe_url),
            snippet: defaults.snippet,
            progress_every: defaults.progress_every,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        HttpClientConfig {
            proxy_url: self.proxy_url.clone(),
            timeout,
            connect_timeout: timeout,
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers.max(1),
            ..Default::default()
        }
    }

    pub fn recheck_cooldown(&self) -> chrono::Duration {
        let secs = self.recheck_cooldown_secs.min(MAX_COOLDOWN_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig("timeout must be at least 1 second".into()));
        }
        if self.snippet.max_chars == 0 {
            return Err(PipelineError::InvalidConfig("snippet length must be positive".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Fails fast when the proxy is not accepting connections.
async fn ensure_proxy(client: &dyn OverlayClient) -> Result<(), PipelineError> {
    if client.proxy_reachable().await {
        return Ok(());
    }
    Err(PipelineError::ProxyUnavailable {
        proxy: client.proxy_label(),
        detail: "not accepting connections before the run started".into(),
    })
}

/// Fatal when every attempted connection failed at the proxy.
fn escalate_proxy_failures(
    client: &dyn OverlayClient,
    attempted: usize,
    proxy_failures: usize,
    what: &str,
) -> Result<(), PipelineError> {
    if attempted > 0 && proxy_failures == attempted {
        return Err(PipelineError::ProxyUnavailable {
            proxy: client.proxy_label(),
            detail: format!("all {attempted} attempted {what} failed at the proxy"),
        });
    }
    Ok(())
}

/// A run counts as cancelled only if shutdown actually left work undone.
fn was_cancelled(not_attempted: usize, shutdown: &ShutdownSignal) -> bool {
    not_attempted > 0 && shutdown.is_triggered()
}

/// Read the signal document. JSON is accepted since it is a subset of YAML.
pub async fn load_signal_config(path: &Path) -> anyhow::Result<SignalConfig> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading signal config {}", path.display()))?;
    let config: SignalConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing signal config {}", path.display()))?;
    Ok(config)
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("anonymity proxy {proxy} unavailable: {detail}")]
    ProxyUnavailable { proxy: String, detail: String },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("invalid signal terms: {0}")]
    Signals(#[from] ExtractError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Observed by workers between items; once set it stays set.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self, reason: &str) {
        if !self.tx.send_replace(true) {
            info!(reason, "shutdown requested; letting in-flight requests finish");
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Shutdown fired by Ctrl-C or, when given, by a run deadline.
pub fn install_shutdown(deadline: Option<Duration>) -> ShutdownSignal {
    let (trigger, signal) = shutdown_channel();
    let trigger = Arc::new(trigger);

    let on_interrupt = Arc::clone(&trigger);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.trigger("interrupt");
        }
    });

    if let Some(deadline) = deadline {
        let on_deadline = Arc::clone(&trigger);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            on_deadline.trigger("run deadline reached");
        });
    }

    signal
}

/// Fixed set of workers draining a shared queue into one bounded result channel.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run<T, R, F, Fut>(&self, items: Vec<T>, shutdown: &ShutdownSignal, work: F) -> PoolRun<T, R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let spawn_count = self.workers.min(items.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let (tx, rx) = mpsc::channel(self.workers * 2);
        let work = Arc::new(work);
        let mut tasks = JoinSet::new();

        for _ in 0..spawn_count {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let work = Arc::clone(&work);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    if shutdown.is_triggered() {
                        break;
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(item) = next else {
                        break;
                    };
                    let result = work(item).await;
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }

        PoolRun {
            results: rx,
            tasks,
            queue,
        }
    }
}

pub struct PoolRun<T, R> {
    results: mpsc::Receiver<R>,
    tasks: JoinSet<()>,
    queue: Arc<Mutex<VecDeque<T>>>,
}

impl<T, R> PoolRun<T, R> {
    /// Next finished item; `None` once every worker has exited.
    pub async fn next(&mut self) -> Option<R> {
        self.results.recv().await
    }

    /// Wait for workers to exit and return how many items were never attempted.
    pub async fn finish(mut self) -> usize {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker task failed");
            }
        }
        let remaining = self.queue.lock().await.len();
        remaining
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub sources_total: usize,
    pub sources_failed: usize,
    pub proxy_failures: usize,
    pub sources_not_attempted: usize,
    pub addresses_found: usize,
    pub addresses_inserted: usize,
}

pub struct SourceIngester {
    client: Arc<dyn OverlayClient>,
    store: Arc<dyn AddressStore>,
    pool: WorkerPool,
}

impl SourceIngester {
    pub fn new(client: Arc<dyn OverlayClient>, store: Arc<dyn AddressStore>, pool: WorkerPool) -> Self {
        Self { client, store, pool }
    }

    pub async fn ingest(
        &self,
        sources: &[String],
        shutdown: &ShutdownSignal,
    ) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport {
            sources_total: sources.len(),
            ..Default::default()
        };
        if sources.is_empty() {
            warn!("no listing sources configured; nothing to ingest");
            return Ok(report);
        }
        ensure_proxy(self.client.as_ref()).await?;

        let client = Arc::clone(&self.client);
        let mut run = self.pool.run(sources.to_vec(), shutdown, move |source: String| {
            let client = Arc::clone(&client);
            async move {
                let fetched = client.fetch_page(&source).await;
                (source, fetched)
            }
        });

        let mut discovered = BTreeSet::new();
        while let Some((source, fetched)) = run.next().await {
            match fetched {
                Ok(page) => {
                    let found = extract_onion_addresses(&page.body);
                    info!(source = %source, count = found.len(), "found addresses from source");
                    discovered.extend(found);
                }
                Err(err) => {
                    report.sources_failed += 1;
                    if err.is_proxy_failure() {
                        report.proxy_failures += 1;
                    }
                    warn!(source = %source, error = %err, "skipping listing source");
                }
            }
        }
        report.sources_not_attempted = run.finish().await;
        let attempted = report.sources_total - report.sources_not_attempted;
        escalate_proxy_failures(self.client.as_ref(), attempted, report.proxy_failures, "source fetches")?;

        report.addresses_found = discovered.len();
        let discovered = discovered.into_iter().collect::<Vec<_>>();
        report.addresses_inserted = self.store.insert_unverified(&discovered).await?;
        info!(
            found = report.addresses_found,
            inserted = report.addresses_inserted,
            failed_sources = report.sources_failed,
            "ingestion complete"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub due: usize,
    pub checked: usize,
    pub alive: usize,
    pub dead: usize,
    pub proxy_failures: usize,
    pub not_attempted: usize,
    pub cancelled: bool,
}

pub struct LivenessVerifier {
    client: Arc<dyn OverlayClient>,
    store: Arc<dyn AddressStore>,
    pool: WorkerPool,
    cooldown: chrono::Duration,
    progress_every: usize,
}

impl LivenessVerifier {
    pub fn new(
        client: Arc<dyn OverlayClient>,
        store: Arc<dyn AddressStore>,
        pool: WorkerPool,
        cooldown: chrono::Duration,
    ) -> Self {
        Self {
            client,
            store,
            pool,
            cooldown,
            progress_every: 100,
        }
    }

    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }

    pub async fn verify(
        &self,
        now: DateTime<Utc>,
        shutdown: &ShutdownSignal,
    ) -> Result<VerifyReport, PipelineError> {
        let due = self.store.due_for_check(now - self.cooldown).await?;
        let mut report = VerifyReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            info!("no addresses due for a liveness check");
            return Ok(report);
        }

        ensure_proxy(self.client.as_ref()).await?;

        info!(due = report.due, workers = self.pool.workers(), "checking liveness");
        let client = Arc::clone(&self.client);
        let mut run = self.pool.run(due, shutdown, move |address: String| {
            let client = Arc::clone(&client);
            async move { check_address(client.as_ref(), address).await }
        });

        while let Some(outcome) = run.next().await {
            if !self.store.record_check(&outcome).await? {
                debug!(address = %outcome.address, "address disappeared before its check was recorded");
            }
            report.checked += 1;
            match outcome.status() {
                AddressStatus::Alive => report.alive += 1,
                AddressStatus::Dead => report.dead += 1,
            }
            if outcome.is_proxy_failure() {
                report.proxy_failures += 1;
            }
            if report.checked % self.progress_every == 0 {
                info!(
                    batch = report.checked / self.progress_every,
                    alive = report.alive,
                    dead = report.dead,
                    "liveness batch complete"
                );
            }
        }
        report.not_attempted = run.finish().await;
        report.cancelled = was_cancelled(report.not_attempted, shutdown);

        info!(
            checked = report.checked,
            alive = report.alive,
            dead = report.dead,
            not_attempted = report.not_attempted,
            "liveness verification finished"
        );

        escalate_proxy_failures(self.client.as_ref(), report.checked, report.proxy_failures, "checks")?;
        Ok(report)
    }
}

async fn check_address(client: &dyn OverlayClient, address: String) -> CheckOutcome {
    let url = address_url(&address);
    let result = client.probe(&url).await;
    let checked_at = Utc::now();
    match result {
        Ok(resp) => {
            debug!(address = %address, status = resp.status, "address alive");
            CheckOutcome::alive(address, checked_at, resp.status)
        }
        Err(err) => {
            if err.is_proxy_failure() {
                warn!(address = %address, error = %err, "proxy failed during check");
            } else {
                debug!(address = %address, error = %err, "address dead");
            }
            CheckOutcome::dead(address, checked_at, err.dead_reason())
        }
    }
}

pub struct RetentionSweeper {
    store: Arc<dyn AddressStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn AddressStore>) -> Self {
        Self { store }
    }

    /// Purge dead addresses not seen alive within `max_age_days` of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>, max_age_days: u32) -> Result<u64, PipelineError> {
        if max_age_days == 0 {
            return Err(PipelineError::InvalidConfig(
                "retention threshold must be at least one day".into(),
            ));
        }
        // Past chrono's range only never-seen records can be older than the cutoff.
        let cutoff = now
            .checked_sub_signed(chrono::Duration::days(i64::from(max_age_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.sweep_dead(cutoff).await?;
        info!(purged, max_age_days, "retention sweep complete");
        Ok(purged)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub alive: usize,
    pub scanned: usize,
    pub findings_inserted: usize,
    pub findings_merged: usize,
    pub no_match: usize,
    pub fetch_failures: usize,
    pub proxy_failures: usize,
    pub parse_failures: usize,
    pub not_attempted: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
enum PageVerdict {
    Matched(FilteredFinding),
    NoMatch,
    FetchFailed(FetchError),
    Unparseable(ExtractError),
}

pub struct ContentFilter {
    client: Arc<dyn OverlayClient>,
    addresses: Arc<dyn AddressStore>,
    findings: Arc<dyn FindingStore>,
    matcher: Arc<SignalMatcher>,
    window: SnippetWindow,
    pool: WorkerPool,
}

impl ContentFilter {
    pub fn new(
        client: Arc<dyn OverlayClient>,
        addresses: Arc<dyn AddressStore>,
        findings: Arc<dyn FindingStore>,
        matcher: Arc<SignalMatcher>,
        window: SnippetWindow,
        pool: WorkerPool,
    ) -> Self {
        Self {
            client,
            addresses,
            findings,
            matcher,
            window,
            pool,
        }
    }

    pub async fn filter(&self, shutdown: &ShutdownSignal) -> Result<FilterReport, PipelineError> {
        let alive = self.addresses.alive_addresses().await?;
        let mut report = FilterReport {
            alive: alive.len(),
            ..Default::default()
        };
        if self.matcher.is_empty() {
            warn!("no keywords or scam patterns configured; skipping content filter");
            return Ok(report);
        }
        if alive.is_empty() {
            info!("no alive addresses to filter");
            return Ok(report);
        }
        ensure_proxy(self.client.as_ref()).await?;

        info!(alive = report.alive, terms = self.matcher.len(), "filtering alive addresses");
        let client = Arc::clone(&self.client);
        let matcher = Arc::clone(&self.matcher);
        let window = self.window;
        let mut run = self.pool.run(alive, shutdown, move |address: String| {
            let client = Arc::clone(&client);
            let matcher = Arc::clone(&matcher);
            async move {
                let verdict = inspect_address(client.as_ref(), &matcher, window, &address).await;
                (address, verdict)
            }
        });

        while let Some((address, verdict)) = run.next().await {
            match verdict {
                PageVerdict::Matched(finding) => {
                    report.scanned += 1;
                    info!(address = %address, terms = ?finding.matched_keywords, "signal match");
                    match self.findings.record_finding(&finding).await? {
                        FindingWrite::Inserted => report.findings_inserted += 1,
                        FindingWrite::Merged => report.findings_merged += 1,
                    }
                }
                PageVerdict::NoMatch => {
                    report.scanned += 1;
                    report.no_match += 1;
                }
                PageVerdict::FetchFailed(err) => {
                    report.fetch_failures += 1;
                    if err.is_proxy_failure() {
                        report.proxy_failures += 1;
                    }
                    warn!(address = %address, error = %err, "could not fetch page");
                }
                PageVerdict::Unparseable(err) => {
                    report.parse_failures += 1;
                    warn!(address = %address, error = %err, "could not parse page");
                }
            }
        }
        report.not_attempted = run.finish().await;
        report.cancelled = was_cancelled(report.not_attempted, shutdown);

        info!(
            scanned = report.scanned,
            inserted = report.findings_inserted,
            merged = report.findings_merged,
            fetch_failures = report.fetch_failures,
            parse_failures = report.parse_failures,
            "content filter finished"
        );

        let attempted = report.scanned + report.fetch_failures + report.parse_failures;
        escalate_proxy_failures(self.client.as_ref(), attempted, report.proxy_failures, "page fetches")?;
        Ok(report)
    }
}

async fn inspect_address(
    client: &dyn OverlayClient,
    matcher: &SignalMatcher,
    window: SnippetWindow,
    address: &str,
) -> PageVerdict {
    let page = match client.fetch_page(&address_url(address)).await {
        Ok(page) => page,
        Err(err) => return PageVerdict::FetchFailed(err),
    };
    let parsed = match ParsedPage::parse(page.content_type.as_deref(), &page.body) {
        Ok(parsed) => parsed,
        Err(err) => return PageVerdict::Unparseable(err),
    };
    match matcher.inspect(&parsed, window) {
        None => PageVerdict::NoMatch,
        Some(signals) => {
            let matched_at = Utc::now();
            PageVerdict::Matched(FilteredFinding {
                address: address.to_string(),
                title: signals.title,
                matched_keywords: signals.matched_terms,
                context_snippet: signals.context_snippet,
                first_matched_at: matched_at,
                last_matched_at: matched_at,
            })
        }
    }
}

/// Where the prober takes its targets from, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTargets {
    Explicit(Vec<String>),
    AddressStore,
    Sources,
}

impl ProbeTargets {
    pub fn select(explicit: Vec<String>, from_store: bool) -> Self {
        if !explicit.is_empty() {
            ProbeTargets::Explicit(explicit)
        } else if from_store {
            ProbeTargets::AddressStore
        } else {
            ProbeTargets::Sources
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable { status: u16, title: String },
    Unreachable { reason: String },
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Reachable { status, title } if title.is_empty() => {
                write!(f, "reachable (HTTP {status})")
            }
            ProbeOutcome::Reachable { status, title } => {
                write!(f, "reachable (HTTP {status}) {title:?}")
            }
            ProbeOutcome::Unreachable { reason } => write!(f, "unreachable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetProbe {
    pub target: String,
    pub url: String,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub run_id: Uuid,
    pub exit_identity: Option<String>,
    pub results: Vec<TargetProbe>,
    pub not_attempted: usize,
}

/// Read-only reachability checks; holds no store that could be written.
pub struct DiagnosticProber {
    client: Arc<dyn OverlayClient>,
    pool: WorkerPool,
    exit_probe_url: String,
}

impl DiagnosticProber {
    pub fn new(client: Arc<dyn OverlayClient>, pool: WorkerPool, exit_probe_url: impl Into<String>) -> Self {
        Self {
            client,
            pool,
            exit_probe_url: exit_probe_url.into(),
        }
    }

    /// Public address of the connection as seen by the exit-identity endpoint.
    pub async fn exit_identity(&self) -> Option<String> {
        match self.client.fetch_page(&self.exit_probe_url).await {
            Ok(page) => {
                let identity = parse_exit_identity(&page.body);
                if identity.is_none() {
                    warn!(url = %self.exit_probe_url, "exit identity response had no origin field");
                }
                identity
            }
            Err(err) => {
                warn!(url = %self.exit_probe_url, error = %err, "exit identity unavailable");
                None
            }
        }
    }

    /// Probe each target; results keep input order, unattempted targets are omitted.
    pub async fn probe_all(
        &self,
        targets: Vec<String>,
        shutdown: &ShutdownSignal,
    ) -> (Vec<TargetProbe>, usize) {
        let client = Arc::clone(&self.client);
        let indexed = targets.into_iter().enumerate().collect::<Vec<_>>();
        let mut run = self.pool.run(indexed, shutdown, move |(index, target): (usize, String)| {
            let client = Arc::clone(&client);
            async move { (index, probe_target(client.as_ref(), target).await) }
        });

        let mut results = Vec::new();
        while let Some(probed) = run.next().await {
            results.push(probed);
        }
        let not_attempted = run.finish().await;
        results.sort_by_key(|(index, _)| *index);
        (results.into_iter().map(|(_, probe)| probe).collect(), not_attempted)
    }

    /// Exit identity plus reachability of every target, under a fresh run id.
    pub async fn report(&self, targets: Vec<String>, shutdown: &ShutdownSignal) -> ProbeReport {
        let run_id = Uuid::new_v4();
        async {
            let exit_identity = self.exit_identity().await;
            info!(
                exit_identity = exit_identity.as_deref().unwrap_or("unavailable"),
                targets = targets.len(),
                "probing"
            );
            let (results, not_attempted) = self.probe_all(targets, shutdown).await;
            ProbeReport {
                run_id,
                exit_identity,
                results,
                not_attempted,
            }
        }
        .instrument(info_span!("probe_run", %run_id))
        .await
    }
}

/// Diagnostic run straight from configuration.
///
/// Nothing is created on disk: the signal document is read only for
/// `Sources`, and the address database is opened read-only only for
/// `AddressStore`.
pub async fn probe_from_config(
    config: &WatchConfig,
    targets: ProbeTargets,
    shutdown: &ShutdownSignal,
) -> Result<ProbeReport, PipelineError> {
    config.validate()?;
    let targets = match targets {
        ProbeTargets::Explicit(targets) => targets,
        ProbeTargets::AddressStore => {
            let store = SqliteStore::open_read_only(&config.address_db).await?;
            let alive = store.alive_addresses().await;
            store.close().await;
            alive?
        }
        ProbeTargets::Sources => load_signal_config(&config.config_path).await?.sources,
    };
    let client = HttpFetcher::new(config.http_client_config())?;
    let prober = DiagnosticProber::new(
        Arc::new(client),
        WorkerPool::new(config.workers),
        config.exit_probe_url.clone(),
    );
    Ok(prober.report(targets, shutdown).await)
}

async fn probe_target(client: &dyn OverlayClient, target: String) -> TargetProbe {
    let url = target_url(&target);
    let outcome = match client.fetch_page(&url).await {
        Ok(page) => ProbeOutcome::Reachable {
            status: page.status,
            title: ParsedPage::parse(page.content_type.as_deref(), &page.body)
                .map(|parsed| parsed.title)
                .unwrap_or_default(),
        },
        Err(FetchError::HttpStatus { status, .. }) => ProbeOutcome::Reachable {
            status,
            title: String::new(),
        },
        Err(err) => ProbeOutcome::Unreachable {
            reason: err.to_string(),
        },
    };
    TargetProbe {
        target,
        url,
        outcome,
    }
}

/// URL for an operator-supplied probe target: URLs pass through, bare hosts get `http://`.
pub fn target_url(target: &str) -> String {
    let trimmed = target.trim();
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    match normalize_address(trimmed) {
        Some(address) => address_url(&address),
        None => format!("http://{}/", trimmed.trim_end_matches('/')),
    }
}

fn parse_exit_identity(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let origin = value.get("origin")?.as_str()?.trim();
    (!origin.is_empty()).then(|| origin.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest: IngestReport,
    pub verify: VerifyReport,
    pub purged: Option<u64>,
    pub alive_total: u64,
    pub dead_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: FilterReport,
}

pub struct Pipeline {
    config: WatchConfig,
    signals: SignalConfig,
    matcher: Arc<SignalMatcher>,
    client: Arc<dyn OverlayClient>,
    addresses: Arc<dyn AddressStore>,
    findings: Arc<dyn FindingStore>,
    databases: Vec<SqliteStore>,
}

impl Pipeline {
    pub fn new(
        config: WatchConfig,
        signals: SignalConfig,
        client: Arc<dyn OverlayClient>,
        addresses: Arc<dyn AddressStore>,
        findings: Arc<dyn FindingStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let matcher = Arc::new(SignalMatcher::new(&signals)?);
        Ok(Self {
            config,
            signals,
            matcher,
            client,
            addresses,
            findings,
            databases: Vec::new(),
        })
    }

    /// Load the signal document, open both databases and build the proxied client.
    pub async fn open(config: WatchConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let signals = load_signal_config(&config.config_path).await?;
        let client = HttpFetcher::new(config.http_client_config())?;

        let address_db = SqliteStore::open(&config.address_db).await?;
        let findings_db = if config.findings_db == config.address_db {
            address_db.clone()
        } else {
            SqliteStore::open(&config.findings_db).await?
        };
        info!(
            address_db = %config.address_db.display(),
            findings_db = %config.findings_db.display(),
            proxy = %client.proxy().url,
            "stores opened"
        );

        let mut pipeline = Self::new(
            config,
            signals,
            Arc::new(client),
            Arc::new(address_db.clone()),
            Arc::new(findings_db.clone()),
        )?;
        pipeline.databases = vec![address_db, findings_db];
        Ok(pipeline)
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn signals(&self) -> &SignalConfig {
        &self.signals
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.config.workers)
    }

    pub fn ingester(&self) -> SourceIngester {
        SourceIngester::new(Arc::clone(&self.client), Arc::clone(&self.addresses), self.pool())
    }

    pub fn verifier(&self) -> LivenessVerifier {
        LivenessVerifier::new(
            Arc::clone(&self.client),
            Arc::clone(&self.addresses),
            self.pool(),
            self.config.recheck_cooldown(),
        )
        .with_progress_every(self.config.progress_every)
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(Arc::clone(&self.addresses))
    }

    pub fn content_filter(&self) -> ContentFilter {
        ContentFilter::new(
            Arc::clone(&self.client),
            Arc::clone(&self.addresses),
            Arc::clone(&self.findings),
            Arc::clone(&self.matcher),
            self.config.snippet,
            self.pool(),
        )
    }

    pub fn prober(&self) -> DiagnosticProber {
        DiagnosticProber::new(Arc::clone(&self.client), self.pool(), self.config.exit_probe_url.clone())
    }

    /// Ingest sources, verify due addresses and optionally sweep stale dead ones.
    pub async fn run_fetch(
        &self,
        clean_old_days: Option<u32>,
        shutdown: &ShutdownSignal,
    ) -> Result<FetchRunSummary, PipelineError> {
        if clean_old_days == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "retention threshold must be at least one day".into(),
            ));
        }
        let run_id = Uuid::new_v4();
        self.fetch_inner(run_id, clean_old_days, shutdown)
            .instrument(info_span!("fetch_run", %run_id))
            .await
    }

    async fn fetch_inner(
        &self,
        run_id: Uuid,
        clean_old_days: Option<u32>,
        shutdown: &ShutdownSignal,
    ) -> Result<FetchRunSummary, PipelineError> {
        let started_at = Utc::now();
        ensure_proxy(self.client.as_ref()).await?;

        let ingest = self
            .ingester()
            .ingest(&self.signals.sources, shutdown)
            .instrument(info_span!("ingest"))
            .await?;
        let verify = self
            .verifier()
            .verify(Utc::now(), shutdown)
            .instrument(info_span!("verify"))
            .await?;
        let purged = match clean_old_days {
            Some(days) => Some(
                self.sweeper()
                    .sweep(Utc::now(), days)
                    .instrument(info_span!("sweep"))
                    .await?,
            ),
            None => None,
        };
        let StatusCounts { alive, dead } = self.addresses.status_counts().await?;

        Ok(FetchRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            ingest,
            verify,
            purged,
            alive_total: alive,
            dead_total: dead,
        })
    }

    pub async fn run_filter(&self, shutdown: &ShutdownSignal) -> Result<FilterRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let report = self
            .content_filter()
            .filter(shutdown)
            .instrument(info_span!("filter_run", %run_id))
            .await?;
        Ok(FilterRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            report,
        })
    }

    pub async fn run_probe(
        &self,
        targets: ProbeTargets,
        shutdown: &ShutdownSignal,
    ) -> Result<ProbeReport, PipelineError> {
        let targets = match targets {
            ProbeTargets::Explicit(targets) => targets,
            ProbeTargets::AddressStore => self.addresses.alive_addresses().await?,
            ProbeTargets::Sources => self.signals.sources.clone(),
        };
        Ok(self.prober().report(targets, shutdown).await)
    }

    pub async fn close(&self) {
        for db in &self.databases {
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use onionwatch_core::{AddressStatus, DeadReason};
    use onionwatch_storage::{FetchedPage, ProbeResponse};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const A: &str = "dreadytofatroptsdj6io7l3xptbet6onoyno2yv7jicoxknyazubrad.onion";
    const B: &str = "torchdeedp3i2jigzjdmfpn5ttjhthh5wbmda2rr3jvqjg5p77c54dqd.onion";
    const C: &str = "juhanurmihxlp77nkq76byazcldy2hlmovfu2epvl5ankdibsot4csyd.onion";

    #[derive(Clone)]
    enum Reply {
        Html(String),
        Text(&'static str, String),
        Status(u16),
        Fail(FetchError),
    }

    struct FakeOverlay {
        replies: HashMap<String, Reply>,
        fallback: Reply,
        proxy_up: bool,
        requests: AtomicUsize,
        stop_on_request: Option<ShutdownTrigger>,
    }

    impl FakeOverlay {
        fn new(fallback: Reply) -> Self {
            Self {
                replies: HashMap::new(),
                fallback,
                proxy_up: true,
                requests: AtomicUsize::new(0),
                stop_on_request: None,
            }
        }

        fn refusing() -> Self {
            Self::new(Reply::Fail(FetchError::Unreachable {
                url: "target".into(),
                detail: "connection refused".into(),
            }))
        }

        fn with(mut self, url: &str, reply: Reply) -> Self {
            self.replies.insert(url.to_string(), reply);
            self
        }

        fn with_page(self, address: &str, html: &str) -> Self {
            self.with(&address_url(address), Reply::Html(html.to_string()))
        }

        fn proxy_down(mut self) -> Self {
            self.proxy_up = false;
            self
        }

        fn stopping(mut self, trigger: ShutdownTrigger) -> Self {
            self.stop_on_request = Some(trigger);
            self
        }

        fn reply(&self, url: &str) -> Reply {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(trigger) = &self.stop_on_request {
                trigger.trigger("test");
            }
            self.replies.get(url).cloned().unwrap_or_else(|| self.fallback.clone())
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OverlayClient for FakeOverlay {
        async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
            match self.reply(url) {
                Reply::Html(_) | Reply::Text(_, _) => Ok(ProbeResponse {
                    status: 200,
                    final_url: url.to_string(),
                }),
                Reply::Status(status) => Ok(ProbeResponse {
                    status,
                    final_url: url.to_string(),
                }),
                Reply::Fail(err) => Err(err),
            }
        }

        async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
            let (content_type, body) = match self.reply(url) {
                Reply::Html(body) => ("text/html; charset=utf-8", body),
                Reply::Text(content_type, body) => (content_type, body),
                Reply::Status(status) => {
                    return Err(FetchError::HttpStatus {
                        status,
                        url: url.to_string(),
                    })
                }
                Reply::Fail(err) => return Err(err),
            };
            Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                content_type: Some(content_type.to_string()),
                body,
                truncated: false,
            })
        }

        async fn proxy_reachable(&self) -> bool {
            self.proxy_up
        }

        fn proxy_label(&self) -> String {
            DEFAULT_PROXY_URL.to_string()
        }
    }

    fn test_config() -> WatchConfig {
        WatchConfig {
            workers: 4,
            ..Default::default()
        }
    }

    fn signals(sources: &[&str], keywords: &[&str]) -> SignalConfig {
        SignalConfig {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            scam_patterns: vec![],
        }
    }

    async fn pipeline_with(
        config: WatchConfig,
        signals: SignalConfig,
        client: FakeOverlay,
    ) -> (Pipeline, Arc<SqliteStore>, Arc<FakeOverlay>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let client = Arc::new(client);
        let pipeline = Pipeline::new(config, signals, client.clone(), store.clone(), store.clone()).unwrap();
        (pipeline, store, client)
    }

    /// Millisecond-aligned timestamp `days` before now, matching stored precision.
    fn days_ago(days: i64) -> DateTime<Utc> {
        let at = Utc::now() - chrono::Duration::days(days);
        Utc.timestamp_millis_opt(at.timestamp_millis()).single().unwrap()
    }

    fn shortly_before_now() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::milliseconds(5)
    }

    async fn seed(store: &SqliteStore, address: &str, alive_at: Option<DateTime<Utc>>) {
        store.insert_unverified(&[address.to_string()]).await.unwrap();
        if let Some(at) = alive_at {
            store.record_check(&CheckOutcome::alive(address, at, 200)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn ingestion_is_idempotent_and_survives_a_failing_source() {
        let listing_one = format!("<p>{A}</p><a href=\"http://www.{}/x\">b</a>", B.to_uppercase());
        let listing_two = format!("mirror: {B} and {C}:8080/path");
        let client = FakeOverlay::refusing()
            .with("http://one.example/", Reply::Html(listing_one))
            .with("http://two.example/", Reply::Text("text/plain", listing_two));
        let sources = ["http://one.example/", "http://two.example/", "http://broken.example/"];
        let (pipeline, store, _) = pipeline_with(test_config(), signals(&sources, &[]), client).await;

        let first = pipeline
            .ingester()
            .ingest(&pipeline.signals().sources, &ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(first.sources_total, 3);
        assert_eq!(first.sources_failed, 1);
        assert_eq!(first.addresses_found, 3);
        assert_eq!(first.addresses_inserted, 3);

        let second = pipeline
            .ingester()
            .ingest(&pipeline.signals().sources, &ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(second.addresses_found, 3);
        assert_eq!(second.addresses_inserted, 0);

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.status == AddressStatus::Dead && r.last_seen.is_none() && r.last_checked.is_none()));
    }

    #[tokio::test]
    async fn refusing_client_marks_everything_dead_without_advancing_last_seen() {
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing()).await;
        let earlier = days_ago(2);
        seed(&store, A, Some(earlier)).await;
        seed(&store, B, None).await;

        let started = shortly_before_now();
        let report = pipeline.verifier().verify(Utc::now(), &ShutdownSignal::never()).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.dead, 2);
        assert_eq!(report.alive, 0);
        assert_eq!(report.proxy_failures, 0);

        let a = store.get(A).await.unwrap().unwrap();
        assert_eq!(a.status, AddressStatus::Dead);
        assert_eq!(a.last_seen, Some(earlier));
        assert!(a.last_checked.unwrap() > started);

        let b = store.get(B).await.unwrap().unwrap();
        assert_eq!(b.status, AddressStatus::Dead);
        assert!(b.last_seen.is_none());
        assert!(b.last_checked.unwrap() > started);
    }

    #[tokio::test]
    async fn any_http_status_counts_as_alive() {
        let client = FakeOverlay::refusing().with(&address_url(A), Reply::Status(503));
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), client).await;
        seed(&store, A, None).await;
        seed(&store, B, None).await;

        let report = pipeline.verifier().verify(Utc::now(), &ShutdownSignal::never()).await.unwrap();
        assert_eq!((report.alive, report.dead), (1, 1));

        let a = store.get(A).await.unwrap().unwrap();
        assert_eq!(a.status, AddressStatus::Alive);
        assert_eq!(a.last_seen, a.last_checked);
    }

    #[tokio::test]
    async fn proxy_failure_on_every_check_is_fatal() {
        let client = FakeOverlay::new(Reply::Fail(FetchError::ProxyUnavailable {
            proxy: DEFAULT_PROXY_URL.into(),
            detail: "connection refused".into(),
        }));
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), client).await;
        seed(&store, A, None).await;
        seed(&store, B, None).await;

        let err = pipeline
            .verifier()
            .verify(Utc::now(), &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }), "{err}");

        for address in [A, B] {
            let record = store.get(address).await.unwrap().unwrap();
            assert_eq!(record.status, AddressStatus::Dead);
            assert!(record.last_checked.is_some());
        }
    }

    #[tokio::test]
    async fn unreachable_proxy_fails_before_touching_records() {
        let (pipeline, store, client) =
            pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing().proxy_down()).await;
        seed(&store, A, None).await;

        let err = pipeline
            .verifier()
            .verify(Utc::now(), &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }));
        assert_eq!(client.request_count(), 0);
        assert!(store.get(A).await.unwrap().unwrap().last_checked.is_none());
    }

    #[tokio::test]
    async fn mixed_proxy_and_target_failures_are_not_fatal() {
        let client = FakeOverlay::refusing().with(
            &address_url(A),
            Reply::Fail(FetchError::ProxyUnavailable {
                proxy: DEFAULT_PROXY_URL.into(),
                detail: "reset".into(),
            }),
        );
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), client).await;
        seed(&store, A, None).await;
        seed(&store, B, None).await;

        let report = pipeline.verifier().verify(Utc::now(), &ShutdownSignal::never()).await.unwrap();
        assert_eq!(report.proxy_failures, 1);
        assert_eq!(report.dead, 2);
    }

    #[tokio::test]
    async fn cooldown_skips_recently_checked_addresses() {
        let config = WatchConfig {
            recheck_cooldown_secs: 3600,
            ..test_config()
        };
        let (pipeline, store, client) = pipeline_with(config, SignalConfig::default(), FakeOverlay::refusing()).await;
        seed(&store, A, None).await;
        seed(&store, B, None).await;
        store
            .record_check(&CheckOutcome::dead(A, Utc::now(), DeadReason::Timeout))
            .await
            .unwrap();

        let report = pipeline.verifier().verify(Utc::now(), &ShutdownSignal::never()).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.checked, 1);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn triggered_shutdown_leaves_items_unattempted() {
        let (pipeline, store, client) =
            pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing()).await;
        seed(&store, A, None).await;
        seed(&store, B, None).await;
        seed(&store, C, None).await;

        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger("test");
        let report = pipeline.verifier().verify(Utc::now(), &shutdown).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.checked, 0);
        assert_eq!(report.not_attempted, 3);
        assert_eq!(client.request_count(), 0);
        assert!(store.get(A).await.unwrap().unwrap().last_checked.is_none());
    }

    #[tokio::test]
    async fn sweeper_purges_only_stale_dead_records() {
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing()).await;
        seed(&store, A, None).await;
        seed(&store, B, Some(days_ago(30))).await;
        seed(&store, C, Some(days_ago(30))).await;
        store
            .record_check(&CheckOutcome::dead(C, Utc::now(), DeadReason::Timeout))
            .await
            .unwrap();

        let sweeper = pipeline.sweeper();
        assert_eq!(sweeper.sweep(Utc::now(), 7).await.unwrap(), 2);
        assert_eq!(sweeper.sweep(Utc::now(), 7).await.unwrap(), 0);

        assert!(store.get(A).await.unwrap().is_none());
        assert!(store.get(C).await.unwrap().is_none());
        let b = store.get(B).await.unwrap().unwrap();
        assert_eq!(b.status, AddressStatus::Alive);

        assert!(matches!(
            sweeper.sweep(Utc::now(), 0).await,
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn sweep_with_huge_threshold_purges_only_never_seen_records() {
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing()).await;
        seed(&store, A, None).await;
        seed(&store, B, Some(days_ago(30))).await;
        store
            .record_check(&CheckOutcome::dead(B, Utc::now(), DeadReason::Timeout))
            .await
            .unwrap();

        let purged = pipeline.sweeper().sweep(Utc::now(), 100_000_000).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(A).await.unwrap().is_none());
        assert!(store.get(B).await.unwrap().is_some());

        let summary = pipeline
            .run_fetch(Some(u32::MAX), &ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(summary.purged, Some(0));
    }

    #[tokio::test]
    async fn shutdown_after_all_work_done_is_not_a_cancellation() {
        let (trigger, shutdown) = shutdown_channel();
        let client = FakeOverlay::refusing().stopping(trigger);
        let (pipeline, store, client) = pipeline_with(test_config(), signals(&[], &["breach"]), client).await;
        seed(&store, A, None).await;

        let verify = pipeline.verifier().verify(Utc::now(), &shutdown).await.unwrap();
        assert!(shutdown.is_triggered());
        assert_eq!((verify.checked, verify.not_attempted), (1, 0));
        assert!(!verify.cancelled);

        store.record_check(&CheckOutcome::alive(A, days_ago(1), 200)).await.unwrap();
        let filter = pipeline.content_filter().filter(&shutdown).await.unwrap();
        assert_eq!(filter.not_attempted, 1);
        assert!(filter.cancelled);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn breach_page_produces_one_finding() {
        let client = FakeOverlay::refusing().with_page(
            A,
            "<html><head><title>Notice</title></head><body><p>data breach confirmed</p></body></html>",
        );
        let (pipeline, store, _) = pipeline_with(test_config(), signals(&[], &["breach", "leak"]), client).await;
        seed(&store, A, Some(Utc::now())).await;

        let summary = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.report.findings_inserted, 1);

        let finding = store.finding_for(A).await.unwrap().unwrap();
        assert_eq!(finding.matched_keywords, vec!["breach"]);
        assert_eq!(finding.title, "Notice");
        assert!(finding.context_snippet.contains("data breach confirmed"));
        assert!(finding.context_snippet.chars().count() <= 200);
    }

    #[tokio::test]
    async fn partial_word_matches_record_nothing() {
        let client = FakeOverlay::refusing().with_page(A, "<p>leakage detected</p>");
        let (pipeline, store, _) = pipeline_with(test_config(), signals(&[], &["breach", "leak"]), client).await;
        seed(&store, A, Some(Utc::now())).await;

        let summary = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.report.no_match, 1);
        assert!(store.finding_for(A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeat_matches_merge_and_quiet_runs_keep_the_finding() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("watch.db")).await.unwrap());
        seed(&store, A, Some(Utc::now())).await;
        let keywords = signals(&[], &["breach", "leak"]);

        let run_with = |html: &str| {
            let client = Arc::new(FakeOverlay::refusing().with_page(A, html));
            Pipeline::new(test_config(), keywords.clone(), client, store.clone(), store.clone()).unwrap()
        };

        run_with("<p>a leak was found</p>")
            .run_filter(&ShutdownSignal::never())
            .await
            .unwrap();
        let first = store.finding_for(A).await.unwrap().unwrap();

        let second_run = run_with("<p>breach and leak</p>")
            .run_filter(&ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(second_run.report.findings_merged, 1);
        let merged = store.finding_for(A).await.unwrap().unwrap();
        assert_eq!(merged.matched_keywords, vec!["leak", "breach"]);
        assert_eq!(merged.first_matched_at, first.first_matched_at);
        assert!(merged.context_snippet.contains("breach and leak"));

        run_with("<p>nothing to see</p>")
            .run_filter(&ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(store.finding_for(A).await.unwrap().unwrap(), merged);
    }

    #[tokio::test]
    async fn filter_failures_never_touch_address_records() {
        let client = FakeOverlay::refusing()
            .with(&address_url(B), Reply::Text("application/pdf", "%PDF breach".into()))
            .with(&address_url(C), Reply::Status(500));
        let (pipeline, store, _) = pipeline_with(test_config(), signals(&[], &["breach"]), client).await;
        let seen = days_ago(1);
        for address in [A, B, C] {
            seed(&store, address, Some(seen)).await;
        }
        let before = store.list().await.unwrap();

        let summary = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.report.fetch_failures, 2);
        assert_eq!(summary.report.parse_failures, 1);
        assert_eq!(store.list().await.unwrap(), before);
        assert!(store.list_findings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filter_with_unreachable_proxy_fails_before_fetching() {
        let client = FakeOverlay::new(Reply::Fail(FetchError::ProxyUnavailable {
            proxy: DEFAULT_PROXY_URL.into(),
            detail: "connection refused".into(),
        })).proxy_down();
        let (pipeline, store, client) = pipeline_with(test_config(), signals(&[], &["breach"]), client).await;
        seed(&store, A, Some(days_ago(1))).await;
        seed(&store, B, Some(days_ago(1))).await;

        let err = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }), "{err}");
        assert_eq!(client.request_count(), 0);
        assert!(store.list_findings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filter_fails_when_every_page_fetch_fails_at_the_proxy() {
        let client = FakeOverlay::new(Reply::Fail(FetchError::ProxyUnavailable {
            proxy: DEFAULT_PROXY_URL.into(),
            detail: "connection refused".into(),
        }));
        let (pipeline, store, client) = pipeline_with(test_config(), signals(&[], &["breach"]), client).await;
        seed(&store, A, Some(days_ago(1))).await;
        seed(&store, B, Some(days_ago(1))).await;
        let before = store.list().await.unwrap();

        let err = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }), "{err}");
        assert_eq!(client.request_count(), 2);
        assert_eq!(store.list().await.unwrap(), before);
    }

    #[tokio::test]
    async fn filter_tolerates_a_single_proxy_failure() {
        let client = FakeOverlay::refusing()
            .with(
                &address_url(A),
                Reply::Fail(FetchError::ProxyUnavailable {
                    proxy: DEFAULT_PROXY_URL.into(),
                    detail: "reset".into(),
                }),
            );
        let (pipeline, store, _) = pipeline_with(test_config(), signals(&[], &["breach"]), client).await;
        seed(&store, A, Some(days_ago(1))).await;
        seed(&store, B, Some(days_ago(1))).await;

        let summary = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.report.proxy_failures, 1);
        assert_eq!(summary.report.fetch_failures, 2);
    }

    #[tokio::test]
    async fn filter_without_terms_fetches_nothing() {
        let (pipeline, store, client) = pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing()).await;
        seed(&store, A, Some(Utc::now())).await;

        let summary = pipeline.run_filter(&ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.report.alive, 1);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn prober_reports_in_input_order_and_writes_nothing() {
        let client = FakeOverlay::refusing()
            .with(DEFAULT_EXIT_PROBE_URL, Reply::Text("application/json", r#"{"origin": "185.220.101.4"}"#.into()))
            .with_page(A, "<title>Alpha</title>")
            .with(&address_url(B), Reply::Status(404));
        let (pipeline, store, _) = pipeline_with(test_config(), SignalConfig::default(), client).await;
        let seen = days_ago(1);
        seed(&store, A, Some(seen)).await;
        seed(&store, B, Some(seen)).await;
        seed(&store, C, Some(seen)).await;
        let before = store.list().await.unwrap();

        let report = pipeline
            .run_probe(ProbeTargets::AddressStore, &ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(report.exit_identity.as_deref(), Some("185.220.101.4"));
        let targets = report.results.iter().map(|r| r.target.as_str()).collect::<Vec<_>>();
        let mut expected = vec![A, B, C];
        expected.sort();
        assert_eq!(targets, expected);

        let outcome_for = |address: &str| {
            report
                .results
                .iter()
                .find(|r| r.target == address)
                .map(|r| r.outcome.clone())
                .unwrap()
        };
        assert_eq!(
            outcome_for(A),
            ProbeOutcome::Reachable {
                status: 200,
                title: "Alpha".into()
            }
        );
        assert_eq!(
            outcome_for(B),
            ProbeOutcome::Reachable {
                status: 404,
                title: String::new()
            }
        );
        assert!(matches!(outcome_for(C), ProbeOutcome::Unreachable { .. }));

        assert_eq!(store.list().await.unwrap(), before);
        assert!(store.list_findings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prober_keeps_explicit_target_order_and_tolerates_missing_exit_identity() {
        let client = FakeOverlay::refusing().with_page(C, "<title>Gamma</title>");
        let (pipeline, _, _) = pipeline_with(test_config(), SignalConfig::default(), client).await;

        let explicit = vec![C.to_string(), format!("http://{A}/"), B.to_uppercase()];
        let report = pipeline
            .run_probe(ProbeTargets::select(explicit.clone(), true), &ShutdownSignal::never())
            .await
            .unwrap();
        assert!(report.exit_identity.is_none());
        assert_eq!(
            report.results.iter().map(|r| r.target.clone()).collect::<Vec<_>>(),
            explicit
        );
        assert_eq!(report.results[2].url, address_url(B));
        assert!(matches!(report.results[0].outcome, ProbeOutcome::Reachable { .. }));
    }

    #[tokio::test]
    async fn fetch_run_ingests_verifies_and_sweeps() {
        let listing = format!("{A} {B}");
        let client = FakeOverlay::refusing()
            .with("http://list.example/", Reply::Html(listing))
            .with_page(A, "<title>up</title>");
        let (pipeline, store, _) =
            pipeline_with(test_config(), signals(&["http://list.example/"], &[]), client).await;

        let summary = pipeline.run_fetch(Some(7), &ShutdownSignal::never()).await.unwrap();
        assert_eq!(summary.ingest.addresses_inserted, 2);
        assert_eq!(summary.verify.alive, 1);
        assert_eq!(summary.verify.dead, 1);
        // B was never seen alive, so the sweep removes it straight away.
        assert_eq!(summary.purged, Some(1));
        assert_eq!((summary.alive_total, summary.dead_total), (1, 0));
        assert_eq!(store.get(A).await.unwrap().unwrap().status, AddressStatus::Alive);

        assert!(matches!(
            pipeline.run_fetch(Some(0), &ShutdownSignal::never()).await,
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn fetch_run_with_unreachable_proxy_fails_even_with_nothing_due() {
        let client = FakeOverlay::refusing().proxy_down();
        let (pipeline, store, client) =
            pipeline_with(test_config(), signals(&["http://list.example/"], &[]), client).await;

        let err = pipeline.run_fetch(None, &ShutdownSignal::never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }), "{err}");
        assert_eq!(client.request_count(), 0);
        assert!(store.list().await.unwrap().is_empty());

        let (idle, _, _) =
            pipeline_with(test_config(), SignalConfig::default(), FakeOverlay::refusing().proxy_down()).await;
        assert!(matches!(
            idle.run_fetch(Some(7), &ShutdownSignal::never()).await,
            Err(PipelineError::ProxyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn ingest_fails_when_every_source_fails_at_the_proxy() {
        let client = FakeOverlay::new(Reply::Fail(FetchError::ProxyUnavailable {
            proxy: DEFAULT_PROXY_URL.into(),
            detail: "connection refused".into(),
        }));
        let sources = ["http://one.example/", "http://two.example/"];
        let (pipeline, _, client) = pipeline_with(test_config(), signals(&sources, &[]), client).await;

        let err = pipeline.run_fetch(None, &ShutdownSignal::never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProxyUnavailable { .. }), "{err}");
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn configured_run_from_explicit_targets_creates_no_databases() {
        let dir = tempdir().expect("tempdir");
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = WatchConfig {
            proxy_url: format!("socks5h://127.0.0.1:{port}"),
            address_db: dir.path().join("onion_links.db"),
            findings_db: dir.path().join("filtered_links.db"),
            config_path: dir.path().join("missing-config.json"),
            http_timeout_secs: 5,
            ..test_config()
        };

        let report = probe_from_config(
            &config,
            ProbeTargets::Explicit(vec![A.to_string()]),
            &ShutdownSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(report.exit_identity, None);
        assert_eq!(report.results.len(), 1);
        assert!(matches!(report.results[0].outcome, ProbeOutcome::Unreachable { .. }));

        assert!(probe_from_config(&config, ProbeTargets::AddressStore, &ShutdownSignal::never())
            .await
            .is_err());
        assert!(!config.address_db.exists());
        assert!(!config.findings_db.exists());
    }

    #[tokio::test]
    async fn worker_pool_respects_its_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(3);

        let (current, max) = (in_flight.clone(), peak.clone());
        let mut run = pool.run((0..20).collect::<Vec<u32>>(), &ShutdownSignal::never(), move |n| {
            let current = current.clone();
            let max = max.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                n * 2
            }
        });

        let mut results = Vec::new();
        while let Some(r) = run.next().await {
            results.push(r);
        }
        assert_eq!(run.finish().await, 0);
        results.sort();
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn signal_config_loads_from_json_and_yaml() {
        let dir = tempdir().unwrap();
        let json = dir.path().join("config.json");
        std::fs::write(
            &json,
            r#"{"sources": ["http://list.example/"], "keywords": ["breach", "leak"]}"#,
        )
        .unwrap();
        let yaml = dir.path().join("config.yaml");
        std::fs::write(&yaml, "keywords:\n  - breach\nscam_patterns:\n  - double your bitcoin\n").unwrap();

        let from_json = load_signal_config(&json).await.unwrap();
        assert_eq!(from_json.sources, vec!["http://list.example/"]);
        assert_eq!(from_json.keywords, vec!["breach", "leak"]);
        assert!(from_json.scam_patterns.is_empty());

        let from_yaml = load_signal_config(&yaml).await.unwrap();
        assert!(from_yaml.sources.is_empty());
        assert_eq!(from_yaml.scam_patterns, vec!["double your bitcoin"]);

        let missing = load_signal_config(&dir.path().join("absent.json")).await.unwrap_err();
        assert!(missing.to_string().contains("reading signal config"));
    }

    #[test]
    fn probe_targets_follow_priority() {
        assert_eq!(
            ProbeTargets::select(vec!["x".into()], true),
            ProbeTargets::Explicit(vec!["x".into()])
        );
        assert_eq!(ProbeTargets::select(vec![], true), ProbeTargets::AddressStore);
        assert_eq!(ProbeTargets::select(vec![], false), ProbeTargets::Sources);
    }

    #[test]
    fn target_urls_normalize_bare_hosts() {
        assert_eq!(target_url(A), format!("http://{A}/"));
        assert_eq!(target_url("https://example.com/x"), "https://example.com/x");
        assert_eq!(target_url("example.com/"), "http://example.com/");
    }

    #[test]
    fn exit_identity_requires_origin() {
        assert_eq!(parse_exit_identity(r#"{"origin":"1.2.3.4"}"#).as_deref(), Some("1.2.3.4"));
        assert_eq!(parse_exit_identity(r#"{"ip":"1.2.3.4"}"#), None);
        assert_eq!(parse_exit_identity("<html>"), None);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = WatchConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
        assert!(test_config().validate().is_ok());
    }
}
