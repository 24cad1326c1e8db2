//! HTTP transport and name resolution.
//!
//! The probe talks to the network only through the [`Transport`],
//! [`Connector`] and [`Resolver`] traits so that the pipeline can be driven
//! against canned responses. [`TransportClient`] and [`SystemResolver`] are the
//! real implementations.

mod client;
mod resolver;

pub use client::TransportClient;
pub use resolver::{Resolver, SystemResolver};

use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// Default request timeout for API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Server errors that are retried with backoff.
pub const DEFAULT_RETRY_STATUSES: [u16; 3] = [502, 503, 504];

/// Base delay of the exponential backoff (1s, 2s, 4s, ...).
pub const DEFAULT_BACKOFF_FACTOR: Duration = Duration::from_secs(1);

/// URL scheme used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// Settings for one [`TransportClient`]: which host it talks to and how hard
/// it tries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub host: String,
    pub scheme: Scheme,
    pub timeout: Duration,
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub retry_statuses: Vec<u16>,
    pub backoff_factor: Duration,
    /// Headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Proxy URL applied to all schemes.
    pub proxy: Option<String>,
    /// Log every request and response.
    pub debug: bool,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scheme: Scheme::Https,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            headers: Vec::new(),
            proxy: None,
            debug: false,
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_factor(mut self, factor: Duration) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// `<scheme>://<host>` without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host.trim_end_matches('/'))
    }

    /// Sleep before retry number `attempt` (0-based): `factor * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.min(16));
        self.backoff_factor.saturating_mul(multiplier)
    }
}

/// What came back from a request once redirects and retries are done.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub headers: HeaderMap,
    /// Final URL after following redirects.
    pub url: String,
    /// URLs that answered with a redirect, in the order they were visited.
    pub history: Vec<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn redirected(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Anything that can GET a path relative to its configured host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError>;
}

/// Builds a [`Transport`] for a host. Each worker owns the clients it builds.
pub trait Connector: Send + Sync + 'static {
    type Client: Transport + 'static;

    fn connect(&self, config: TransportConfig) -> Result<Self::Client, TransportError>;
}

/// Connector producing real [`TransportClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    type Client = TransportClient;

    fn connect(&self, config: TransportConfig) -> Result<TransportClient, TransportError> {
        TransportClient::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::new("cn114.awmdm.com");
        assert_eq!(config.scheme, Scheme::Https);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_statuses, vec![502, 503, 504]);
        assert_eq!(config.base_url(), "https://cn114.awmdm.com");
    }

    #[test]
    fn test_backoff_doubles() {
        let config = TransportConfig::new("ip-api.com");
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        // Large attempt counts saturate instead of overflowing.
        assert!(config.backoff_delay(u32::MAX) >= Duration::from_secs(65536));
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse {
            status: 200,
            body: r#"{"status":"success"}"#.to_string(),
            headers: HeaderMap::new(),
            url: "https://cn114.awmdm.com/AirWatch/Login".to_string(),
            history: vec!["https://cn114.awmdm.com/".to_string()],
        };
        assert!(response.is_success());
        assert!(response.redirected());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["status"], "success");
    }
}
