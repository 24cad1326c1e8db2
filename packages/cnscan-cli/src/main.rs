//! cnscan CLI - enumerate SaaS tenant instances and collect their metadata
//!
//! This binary can:
//! - Scan a range of `<prefix><N>.<domain>` instances with a worker pool
//! - Probe individual instances
//! - Show the resolved configuration
//!
//! Records go to stdout as they complete; logs go to stderr.

mod shutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cnscan_core::InstanceRecord;
use cnscan_core::config::{self, ConfigSource, ScanSettings};
use cnscan_core::render;
use cnscan_core::scanner::ScanOrchestrator;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Records between progress log lines.
const PROGRESS_INTERVAL: u64 = 100;

#[derive(Parser)]
#[command(name = "cnscan")]
#[command(version)]
#[command(about = "Enumerate SaaS tenant instances and collect their metadata")]
#[command(long_about = "
cnscan probes numbered tenant hosts (cn0.awmdm.com, cn1.awmdm.com, ...) and
reports which exist, whether they answer, their product version, where they
redirect and where they are hosted.

Quick start:
  1. Scan the default range:  cnscan scan > instances.csv
  2. Probe a few instances:   cnscan probe 40 138 --format text
  3. Show configuration:      cnscan config
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "csv")]
    pub format: OutputFormat,

    /// Read configuration from this file instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    Csv,
    /// One JSON object per line for scripting
    Json,
    /// Human-readable text output
    Text,
}

impl From<OutputFormat> for render::OutputFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Csv => render::OutputFormat::Csv,
            OutputFormat::Json => render::OutputFormat::Json,
            OutputFormat::Text => render::OutputFormat::Text,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a range of instances
    Scan {
        /// Number of instances to scan
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// First instance ID
        #[arg(short, long)]
        start: Option<u64>,

        /// Concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Domain the instances live under
        #[arg(short, long)]
        domain: Option<String>,

        /// Proxy URL for all requests
        #[arg(long)]
        proxy: Option<String>,

        /// Skip IP geolocation
        #[arg(long)]
        no_geo: bool,
    },

    /// Probe specific instances one after another
    Probe {
        /// Instance IDs
        #[arg(required = true)]
        ids: Vec<u64>,

        /// Domain the instances live under
        #[arg(short, long)]
        domain: Option<String>,

        /// Skip IP geolocation
        #[arg(long)]
        no_geo: bool,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout only carries records
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    format!("cnscan={},cnscan_core={}", log_level, log_level).into()
                }),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let settings = load_settings(&cli)?;

    match &cli.command {
        Commands::Scan {
            count,
            start,
            workers,
            domain,
            proxy,
            no_geo,
        } => {
            let mut settings = settings;
            let overrides = ScanOverrides {
                count: *count,
                start: *start,
                workers: *workers,
                domain: domain.clone(),
                proxy: proxy.clone(),
                no_geo: *no_geo,
            };
            overrides.apply(&mut settings);
            cmd_scan(&cli, settings).await
        }
        Commands::Probe { ids, domain, no_geo } => {
            let mut settings = settings;
            let overrides = ScanOverrides {
                domain: domain.clone(),
                no_geo: *no_geo,
                ..ScanOverrides::default()
            };
            overrides.apply(&mut settings);
            cmd_probe(&cli, settings, ids).await
        }
        Commands::Config => cmd_config(&cli, &settings),
    }
}

fn load_settings(cli: &Cli) -> Result<ScanSettings> {
    match &cli.config {
        Some(path) => config::load_scan_settings_from(path, |key| std::env::var(key).ok())
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(config::load_scan_settings()),
    }
}

/// Command-line flags that take precedence over file and environment.
#[derive(Default)]
struct ScanOverrides {
    count: Option<u64>,
    start: Option<u64>,
    workers: Option<usize>,
    domain: Option<String>,
    proxy: Option<String>,
    no_geo: bool,
}

impl ScanOverrides {
    fn apply(self, settings: &mut ScanSettings) {
        let mut changed = false;

        if let Some(count) = self.count {
            settings.count = count;
            changed = true;
        }
        if let Some(start) = self.start {
            settings.start = start;
            changed = true;
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
            changed = true;
        }
        if let Some(domain) = self.domain {
            settings.domain = domain;
            changed = true;
        }
        if let Some(proxy) = self.proxy {
            settings.transport.proxy = Some(proxy);
            changed = true;
        }
        if self.no_geo {
            settings.geolocation.enabled = false;
            changed = true;
        }

        if changed {
            settings.source = ConfigSource::CommandLine;
        }
    }
}

/// Write one line to stdout. Returns false once stdout is gone.
fn emit(line: &str) -> bool {
    let mut out = io::stdout().lock();
    match writeln!(out, "{}", line).and_then(|_| out.flush()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Stopping output: {}", e);
            false
        }
    }
}

async fn cmd_scan(cli: &Cli, settings: ScanSettings) -> Result<()> {
    settings.validate().context("Invalid scan configuration")?;

    let renderer = render::OutputFormat::from(cli.format).renderer();
    let range = settings.start..settings.start + settings.count;
    let workers = settings.workers;
    let total = settings.count;

    let scan = ScanOrchestrator::with_defaults(settings);
    shutdown::cancel_on_signal(scan.cancellation_token());

    if let Some(header) = renderer.header() {
        if !emit(&header) {
            return Ok(());
        }
    }

    let started = Instant::now();
    let mut stream = scan.run_range(range, workers);
    let mut seen = 0u64;
    let mut active = 0u64;

    while let Some(record) = stream.next_record().await {
        seen += 1;
        if record.is_active() {
            active += 1;
        }

        if !emit(&renderer.render(&record)) {
            stream.cancel();
            break;
        }

        if seen % PROGRESS_INTERVAL == 0 {
            tracing::info!(
                "Progress: {}/{} probed, {} active, {:.1}s elapsed",
                seen,
                total,
                active,
                started.elapsed().as_secs_f64()
            );
        }
    }

    let summary = stream.finish().await;
    if summary.faults > 0 {
        tracing::warn!("{} instances were skipped after probe failures", summary.faults);
    }
    if summary.cancelled {
        tracing::warn!(
            "Scan stopped early: {} of {} instances probed",
            summary.probed,
            summary.requested
        );
    }

    Ok(())
}

async fn cmd_probe(cli: &Cli, settings: ScanSettings, ids: &[u64]) -> Result<()> {
    settings.validate().context("Invalid probe configuration")?;

    let renderer = render::OutputFormat::from(cli.format).renderer();
    let scan = ScanOrchestrator::with_defaults(settings);
    let cancel = scan.cancellation_token();
    shutdown::cancel_on_signal(cancel.clone());
    let probe = scan.probe();

    if let Some(header) = renderer.header() {
        if !emit(&header) {
            return Ok(());
        }
    }

    for &id in ids {
        let record: Option<InstanceRecord> = probe.run(id, &cancel).await;
        match record {
            Some(record) => {
                if !emit(&renderer.render(&record)) {
                    break;
                }
            }
            None => {
                tracing::info!("Probe cancelled at instance {}", id);
                break;
            }
        }
    }

    // Release the signal listeners.
    cancel.cancel();
    Ok(())
}

fn cmd_config(cli: &Cli, settings: &ScanSettings) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.display().to_string(),
        None => config::get_config_file_path_string(),
    };

    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "source": settings.source.to_string(),
                "domain": settings.domain,
                "host_prefix": settings.host_prefix,
                "start": settings.start,
                "count": settings.count,
                "workers": settings.workers,
                "proxy": settings.transport.proxy,
                "timeout_secs": settings.transport.timeout.as_secs(),
                "retries": settings.transport.retries,
                "geolocation": {
                    "enabled": settings.geolocation.enabled,
                    "host": settings.geolocation.host,
                    "scheme": settings.geolocation.scheme.to_string(),
                    "style": settings.geolocation.style.to_string(),
                },
            }));
        }
        OutputFormat::Csv | OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:   {}", config_path);
            println!("Loaded from:   {}", settings.source);
            println!("Instances:     {}", settings.instance_host(settings.start));
            println!("Range:         {} instances from {}", settings.count, settings.start);
            println!("Workers:       {}", settings.workers);
            println!(
                "Proxy:         {}",
                settings.transport.proxy.as_deref().unwrap_or("-")
            );
            println!(
                "Geolocation:   {} ({}://{}, {})",
                if settings.geolocation.enabled { "enabled" } else { "disabled" },
                settings.geolocation.scheme,
                settings.geolocation.host,
                settings.geolocation.style
            );
            println!();
            println!("Environment variables:");
            println!("  CNSCAN_DOMAIN   - Override instance domain");
            println!("  CNSCAN_PROXY    - Route requests through a proxy");
            println!("  CNSCAN_GEO_HOST - Override geolocation service host");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
    }

    Ok(())
}
