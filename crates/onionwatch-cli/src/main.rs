use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use onionwatch_pipeline::{install_shutdown, probe_from_config, Pipeline, ProbeTargets, WatchConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "onionwatch")]
#[command(about = "Discover, verify and triage onion services through a local SOCKS proxy")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Signal document with sources, keywords and scam patterns (JSON or YAML).
    #[arg(long, global = true, env = "ONIONWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// SOCKS proxy every request is routed through.
    #[arg(long, global = true, env = "ONIONWATCH_PROXY")]
    proxy: Option<String>,
    #[arg(long, global = true, env = "ONIONWATCH_ADDRESS_DB")]
    address_db: Option<PathBuf>,
    #[arg(long, global = true, env = "ONIONWATCH_FINDINGS_DB")]
    findings_db: Option<PathBuf>,
    #[arg(long, global = true, env = "ONIONWATCH_WORKERS", value_parser = clap::value_parser!(u16).range(1..))]
    workers: Option<u16>,
    /// Per-request timeout in seconds.
    #[arg(long, global = true, env = "ONIONWATCH_TIMEOUT_SECS", value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,
    /// Stop taking new work after this many seconds.
    #[arg(long, global = true, env = "ONIONWATCH_DEADLINE_SECS", value_parser = clap::value_parser!(u64).range(1..))]
    deadline_secs: Option<u64>,
    /// Skip addresses checked more recently than this.
    #[arg(long, global = true, env = "ONIONWATCH_RECHECK_COOLDOWN_SECS")]
    recheck_cooldown_secs: Option<u64>,
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl GlobalOpts {
    fn watch_config(&self) -> WatchConfig {
        let mut config = WatchConfig::from_env();
        if let Some(path) = &self.config {
            config.config_path = path.clone();
        }
        if let Some(proxy) = &self.proxy {
            config.proxy_url = proxy.clone();
        }
        if let Some(path) = &self.address_db {
            config.address_db = path.clone();
        }
        if let Some(path) = &self.findings_db {
            config.findings_db = path.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = usize::from(workers);
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(secs) = self.deadline_secs {
            config.run_deadline_secs = Some(secs);
        }
        if let Some(secs) = self.recheck_cooldown_secs {
            config.recheck_cooldown_secs = secs;
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest listing sources and check which known addresses are alive.
    Fetch {
        /// Also purge dead addresses not seen alive in this many days.
        #[arg(long, value_name = "DAYS", value_parser = clap::value_parser!(u32).range(1..))]
        clean_old: Option<u32>,
    },
    /// Scan alive addresses for keywords and scam patterns.
    Filter,
    /// Report exit identity and reachability without writing anything.
    Probe {
        /// Probe alive addresses from the address store.
        #[arg(long)]
        from_db: bool,
        /// Addresses or URLs to probe; overrides --from-db and the configured sources.
        targets: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.global.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.global.watch_config();
    tracing::debug!(?config, "resolved configuration");
    let shutdown = install_shutdown(config.run_deadline());
    match cli.command.unwrap_or(Commands::Fetch { clean_old: None }) {
        Commands::Probe { from_db, targets } => {
            let report = probe_from_config(&config, ProbeTargets::select(targets, from_db), &shutdown).await?;
            println!(
                "exit identity: {}",
                report.exit_identity.as_deref().unwrap_or("unavailable")
            );
            for probe in &report.results {
                println!("{} -> {}", probe.target, probe.outcome);
            }
            if report.not_attempted > 0 {
                println!("{} targets not attempted", report.not_attempted);
            }
        }
        Commands::Fetch { clean_old } => {
            let pipeline = Pipeline::open(config).await?;
            let outcome = pipeline.run_fetch(clean_old, &shutdown).await;
            pipeline.close().await;
            let s = outcome?;
            println!(
                "fetch complete: run_id={} sources={} failed_sources={} new={} checked={} alive={} dead={} not_attempted={}",
                s.run_id,
                s.ingest.sources_total,
                s.ingest.sources_failed,
                s.ingest.addresses_inserted,
                s.verify.checked,
                s.verify.alive,
                s.verify.dead,
                s.verify.not_attempted,
            );
            if let Some(purged) = s.purged {
                println!("purged {purged} stale dead addresses");
            }
            println!("store totals: alive={} dead={}", s.alive_total, s.dead_total);
            if s.verify.cancelled {
                println!("run cancelled before all addresses were checked");
            }
        }
        Commands::Filter => {
            let pipeline = Pipeline::open(config).await?;
            let outcome = pipeline.run_filter(&shutdown).await;
            pipeline.close().await;
            let s = outcome?;
            let r = &s.report;
            println!(
                "filter complete: run_id={} alive={} scanned={} new_findings={} updated_findings={} fetch_failures={} parse_failures={} not_attempted={}",
                s.run_id,
                r.alive,
                r.scanned,
                r.findings_inserted,
                r.findings_merged,
                r.fetch_failures,
                r.parse_failures,
                r.not_attempted,
            );
            if r.cancelled {
                println!("run cancelled before all addresses were scanned");
            }
        }
    }
    Ok(())
}
