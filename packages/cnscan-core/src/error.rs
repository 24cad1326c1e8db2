//! Error types shared across the crate.

use thiserror::Error;

/// Failure of a single transport call, after retries were exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The server closed or reset the connection before a full response.
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and connection-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::ConnectionRefused(_)
                | TransportError::ConnectionDropped(_)
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout;
        }

        let chain = error_chain(&err);
        if err.is_connect() {
            if chain.contains("dns error") || chain.contains("failed to lookup address") {
                let host = err
                    .url()
                    .and_then(|u| u.host_str())
                    .unwrap_or_default()
                    .to_string();
                return TransportError::DnsFailure { host, reason: chain };
            }
            return TransportError::ConnectionRefused(chain);
        }
        if is_dropped_connection(&err, &chain) {
            return TransportError::ConnectionDropped(chain);
        }

        TransportError::Other(chain)
    }
}

/// Whether `err` means the peer went away mid-exchange.
fn is_dropped_connection(err: &(dyn std::error::Error + 'static), chain: &str) -> bool {
    use std::io::ErrorKind;

    let mut source = Some(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = inner.source();
    }

    chain.contains("connection closed before message completed")
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

/// Why a probe stage produced no value. Never escapes the probe: stage 1-2
/// errors mark the instance inactive, the rest leave a field unset.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("DNS lookup failed: {0}")]
    Dns(TransportError),

    #[error("host unreachable: {0}")]
    Unreachable(TransportError),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("could not parse response: {0}")]
    Parse(String),

    #[error("geolocation unavailable: {0}")]
    GeolocationUnavailable(String),
}

/// Configuration that could not be read or made sense of.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
