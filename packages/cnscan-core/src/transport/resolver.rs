//! Name resolution through the platform resolver.

use crate::error::TransportError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Resolves a hostname to the address the probe should report.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError>;
}

/// Uses the operating system resolver (`getaddrinfo`) via tokio.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        let lookup = tokio::net::lookup_host((host, 443));
        let addrs = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.map(|sa| sa.ip()).collect::<Vec<_>>(),
            Ok(Err(e)) => {
                return Err(TransportError::DnsFailure {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::DnsFailure {
                    host: host.to_string(),
                    reason: format!("lookup timed out after {:?}", self.timeout),
                });
            }
        };

        pick_address(&addrs).ok_or_else(|| TransportError::DnsFailure {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
    }
}

/// Prefer IPv4, matching what the geolocation service expects.
fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
