//! Scan configuration.
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults
//! 2. Config file (`~/.config/cnscan/config.toml`)
//! 3. Environment variables (`CNSCAN_DOMAIN`, `CNSCAN_PROXY`, `CNSCAN_GEO_HOST`)
//!
//! Command-line flags are applied on top by the CLI.

use crate::error::ConfigError;
use crate::scanner::GeoStyle;
use crate::transport::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_STATUSES, DEFAULT_TIMEOUT, Scheme,
    TransportConfig,
};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default tenant domain; instances live at `cn<N>.awmdm.com`.
pub const DEFAULT_DOMAIN: &str = "awmdm.com";

/// Default number of instance IDs to scan, starting at 0.
pub const DEFAULT_COUNT: u64 = 5000;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 10;

/// Upper bound on concurrent workers.
pub const MAX_WORKERS: usize = 1024;

/// Default geolocation service host.
pub const DEFAULT_GEO_HOST: &str = "ip-api.com";

/// The geolocation service rejects requests without a browser-like agent.
pub const DEFAULT_GEO_USER_AGENT: &str = "Mozilla/5.0";

const ENV_DOMAIN: &str = "CNSCAN_DOMAIN";
const ENV_PROXY: &str = "CNSCAN_PROXY";
const ENV_GEO_HOST: &str = "CNSCAN_GEO_HOST";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    scan: Option<ScanSection>,
    transport: Option<TransportSection>,
    geolocation: Option<GeoSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ScanSection {
    domain: Option<String>,
    host_prefix: Option<String>,
    liveness_path: Option<String>,
    start: Option<u64>,
    count: Option<u64>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TransportSection {
    timeout_secs: Option<u64>,
    retries: Option<u32>,
    liveness_timeout_secs: Option<u64>,
    liveness_retries: Option<u32>,
    backoff_factor_ms: Option<u64>,
    retry_statuses: Option<Vec<u16>>,
    proxy: Option<String>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GeoSection {
    enabled: Option<bool>,
    host: Option<String>,
    scheme: Option<Scheme>,
    style: Option<GeoStyle>,
    user_agent: Option<String>,
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from config file
    ConfigFile,
    /// Overridden by environment variables
    Environment,
    /// Overridden by command-line flags
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::ConfigFile => write!(f, "config file"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::CommandLine => write!(f, "command line"),
        }
    }
}

/// How the probe's HTTP clients behave.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub retries: u32,
    /// Liveness checks fail fast: dead hosts dominate scan time.
    pub liveness_timeout: Duration,
    pub liveness_retries: u32,
    pub backoff_factor: Duration,
    pub retry_statuses: Vec<u16>,
    pub proxy: Option<String>,
    /// User-Agent for instance requests; the HTTP client default when unset.
    pub user_agent: Option<String>,
    pub debug: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_MAX_RETRIES,
            liveness_timeout: Duration::from_secs(2),
            liveness_retries: 2,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            proxy: None,
            user_agent: None,
            debug: false,
        }
    }
}

/// Geolocation service settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoSettings {
    pub enabled: bool,
    pub host: String,
    pub scheme: Scheme,
    pub style: GeoStyle,
    pub user_agent: String,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_GEO_HOST.to_string(),
            scheme: Scheme::Http,
            style: GeoStyle::IpApi,
            user_agent: DEFAULT_GEO_USER_AGENT.to_string(),
        }
    }
}

/// Everything a scan needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub domain: String,
    pub host_prefix: String,
    /// Path requested by the liveness check, relative to `/`.
    pub liveness_path: String,
    pub start: u64,
    pub count: u64,
    pub workers: usize,
    pub transport: TransportSettings,
    pub geolocation: GeoSettings,
    /// Highest layer that changed anything.
    pub source: ConfigSource,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            host_prefix: "cn".to_string(),
            liveness_path: String::new(),
            start: 0,
            count: DEFAULT_COUNT,
            workers: DEFAULT_WORKERS,
            transport: TransportSettings::default(),
            geolocation: GeoSettings::default(),
            source: ConfigSource::Default,
        }
    }
}

impl ScanSettings {
    /// Hostname of an instance, e.g. `cn138.awmdm.com`.
    pub fn instance_host(&self, id: u64) -> String {
        format!("{}{}.{}", self.host_prefix, id, self.domain)
    }

    /// Client settings for the version and redirect stages.
    pub fn api_transport(&self, id: u64) -> TransportConfig {
        self.instance_transport(id)
            .with_timeout(self.transport.timeout)
            .with_retries(self.transport.retries)
    }

    /// Client settings for the liveness stage.
    pub fn liveness_transport(&self, id: u64) -> TransportConfig {
        self.instance_transport(id)
            .with_timeout(self.transport.liveness_timeout)
            .with_retries(self.transport.liveness_retries)
    }

    fn instance_transport(&self, id: u64) -> TransportConfig {
        let mut config = TransportConfig::new(self.instance_host(id))
            .with_backoff_factor(self.transport.backoff_factor)
            .with_proxy(self.transport.proxy.clone())
            .with_debug(self.transport.debug);
        config.retry_statuses = self.transport.retry_statuses.clone();
        if let Some(ref agent) = self.transport.user_agent {
            config = config.with_header("User-Agent", agent.clone());
        }
        config
    }

    /// Client settings for the geolocation service.
    pub fn geo_transport(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.geolocation.host.clone())
            .with_scheme(self.geolocation.scheme)
            .with_timeout(self.transport.timeout)
            .with_retries(self.transport.retries)
            .with_backoff_factor(self.transport.backoff_factor)
            .with_header("User-Agent", self.geolocation.user_agent.clone())
            .with_proxy(self.transport.proxy.clone())
            .with_debug(self.transport.debug);
        config.retry_statuses = self.transport.retry_statuses.clone();
        config
    }

    /// Reject settings a scan cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "domain",
                reason: "must not be empty".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: format!("{} exceeds the limit of {}", self.workers, MAX_WORKERS),
            });
        }
        if self.start.checked_add(self.count).is_none() {
            return Err(ConfigError::Invalid {
                field: "count",
                reason: format!("start {} + count {} overflows", self.start, self.count),
            });
        }
        if self.geolocation.enabled && self.geolocation.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "geolocation.user_agent",
                reason: "the geolocation service rejects requests without a User-Agent"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn apply_file(&mut self, file: ConfigFile) {
        let mut changed = false;

        if let Some(scan) = file.scan {
            changed |= set(&mut self.domain, non_empty(scan.domain));
            changed |= set(&mut self.host_prefix, scan.host_prefix);
            changed |= set(&mut self.liveness_path, scan.liveness_path);
            changed |= set(&mut self.start, scan.start);
            changed |= set(&mut self.count, scan.count);
            changed |= set(&mut self.workers, scan.workers);
        }

        if let Some(t) = file.transport {
            let transport = &mut self.transport;
            changed |= set(&mut transport.timeout, t.timeout_secs.map(Duration::from_secs));
            changed |= set(&mut transport.retries, t.retries);
            changed |= set(
                &mut transport.liveness_timeout,
                t.liveness_timeout_secs.map(Duration::from_secs),
            );
            changed |= set(&mut transport.liveness_retries, t.liveness_retries);
            changed |= set(
                &mut transport.backoff_factor,
                t.backoff_factor_ms.map(Duration::from_millis),
            );
            changed |= set(&mut transport.retry_statuses, t.retry_statuses);
            if let Some(proxy) = non_empty(t.proxy) {
                transport.proxy = Some(proxy);
                changed = true;
            }
            if let Some(agent) = non_empty(t.user_agent) {
                transport.user_agent = Some(agent);
                changed = true;
            }
        }

        if let Some(g) = file.geolocation {
            let geo = &mut self.geolocation;
            changed |= set(&mut geo.enabled, g.enabled);
            changed |= set(&mut geo.host, non_empty(g.host));
            changed |= set(&mut geo.scheme, g.scheme);
            changed |= set(&mut geo.style, g.style);
            changed |= set(&mut geo.user_agent, g.user_agent);
        }

        if changed {
            self.source = ConfigSource::ConfigFile;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let mut changed = false;

        if let Some(domain) = non_empty(env(ENV_DOMAIN)) {
            tracing::info!("Using instance domain from environment variable: {}", domain);
            self.domain = domain;
            changed = true;
        }
        if let Some(proxy) = non_empty(env(ENV_PROXY)) {
            tracing::info!("Using proxy from environment variable: {}", proxy);
            self.transport.proxy = Some(proxy);
            changed = true;
        }
        if let Some(host) = non_empty(env(ENV_GEO_HOST)) {
            tracing::info!("Using geolocation host from environment variable: {}", host);
            self.geolocation.host = host;
            changed = true;
        }

        if changed {
            self.source = ConfigSource::Environment;
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("cnscan").join("config.toml"))
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/cnscan/config.toml".to_string())
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load settings from the default config file location and the process
/// environment. A broken default config file is logged and skipped.
pub fn load_scan_settings() -> ScanSettings {
    let mut settings = ScanSettings::default();

    if let Some(path) = get_config_file_path().filter(|p| p.exists()) {
        match read_config_file(&path) {
            Ok(file) => {
                tracing::debug!("Loaded config from {:?}", path);
                settings.apply_file(file);
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

/// Load settings from an explicit config file. Unlike the default location,
/// a file named by the operator must exist and parse.
pub fn load_scan_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ScanSettings, ConfigError> {
    let mut settings = ScanSettings::default();
    settings.apply_file(read_config_file(path)?);
    tracing::debug!("Loaded config from {:?}", path);
    settings.apply_env(env);
    Ok(settings)
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# cnscan configuration
# Place this file at: ~/.config/cnscan/config.toml

[scan]
# Instances are probed at <host_prefix><id>.<domain>
# domain = "awmdm.com"
# host_prefix = "cn"
# start = 0
# count = 5000
# workers = 10

[transport]
# timeout_secs = 10
# retries = 5
# liveness_timeout_secs = 2
# liveness_retries = 2
# backoff_factor_ms = 1000
# retry_statuses = [502, 503, 504]
# proxy = "http://127.0.0.1:8080"

[geolocation]
# enabled = true
# host = "ip-api.com"
# scheme = "http"
# style = "ip-api"        # or "path-suffix" for <host>/<ip>/json services
# user_agent = "Mozilla/5.0"
"#
    .to_string()
}
