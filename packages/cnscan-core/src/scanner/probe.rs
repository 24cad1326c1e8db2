//! Per-instance probing pipeline.
//!
//! ```text
//! Init -> DnsResolved | DnsFailed
//!      -> Active | Inactive
//!      -> [VersionKnown, RedirectKnown, LocationKnown]*
//!      -> Done
//! ```
//!
//! DNS and liveness failures end the pipeline with `active = false`. The
//! enrichment stages after that are independent: each one either fills its
//! field or leaves it unset.

use super::parse::{self, GeoStyle};
use super::record::{API_PROTECTED, InstanceRecord};
use crate::config::ScanSettings;
use crate::error::StageError;
use crate::transport::{Connector, Resolver, Transport};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Current version manifest.
pub const VERSION_PATH: &str = "/api/help/local.json";

/// Where older releases serve the version manifest.
pub const LEGACY_VERSION_PATH: &str = "/api/system/help/localjson";

/// Pipeline position of a probe, used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    Init,
    DnsResolved,
    DnsFailed,
    Active,
    Inactive,
    VersionKnown,
    RedirectKnown,
    LocationKnown,
    Done,
}

impl fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStage::Init => "init",
            ProbeStage::DnsResolved => "dns_resolved",
            ProbeStage::DnsFailed => "dns_failed",
            ProbeStage::Active => "active",
            ProbeStage::Inactive => "inactive",
            ProbeStage::VersionKnown => "version_known",
            ProbeStage::RedirectKnown => "redirect_known",
            ProbeStage::LocationKnown => "location_known",
            ProbeStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Runs the pipeline for one instance ID at a time.
///
/// A probe belongs to a single worker. It keeps one geolocation client for
/// its whole life and builds fresh instance clients for every ID.
pub struct InstanceProbe<C: Connector, R: Resolver> {
    settings: Arc<ScanSettings>,
    connector: Arc<C>,
    resolver: Arc<R>,
    geo: Option<C::Client>,
}

impl<C: Connector, R: Resolver> InstanceProbe<C, R> {
    pub fn new(settings: Arc<ScanSettings>, connector: Arc<C>, resolver: Arc<R>) -> Self {
        let geo = if settings.geolocation.enabled {
            match connector.connect(settings.geo_transport()) {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!("Geolocation disabled, could not build client: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            settings,
            connector,
            resolver,
            geo,
        }
    }

    /// Probe one instance. Returns `None` only if `cancel` fired before the
    /// pipeline finished; the partial record is dropped.
    pub async fn run(&self, id: u64, cancel: &CancellationToken) -> Option<InstanceRecord> {
        let mut record = InstanceRecord::new(id);
        let host = self.settings.instance_host(id);
        trace_stage(id, ProbeStage::Init);

        let ip = match cancellable(cancel, self.resolver.resolve(&host)).await? {
            Ok(ip) => ip,
            Err(e) => {
                trace_failure(id, ProbeStage::DnsFailed, &StageError::Dns(e));
                record.mark_active(false);
                return Some(record);
            }
        };
        record.set_ip_address(ip.to_string());
        trace_stage(id, ProbeStage::DnsResolved);

        if let Err(e) = cancellable(cancel, self.check_liveness(id)).await? {
            trace_failure(id, ProbeStage::Inactive, &e);
            record.mark_active(false);
            return Some(record);
        }
        record.mark_active(true);
        trace_stage(id, ProbeStage::Active);

        match self.connector.connect(self.settings.api_transport(id)) {
            Ok(api) => {
                match cancellable(cancel, discover_version(&api)).await? {
                    Ok(version) => {
                        tracing::debug!("Instance {} version: {}", id, version);
                        record.set_version(version);
                        trace_stage(id, ProbeStage::VersionKnown);
                    }
                    Err(e) => trace_failure(id, ProbeStage::VersionKnown, &e),
                }

                match cancellable(cancel, discover_hostname(&api)).await? {
                    Ok(Some(hostname)) => {
                        tracing::debug!("Instance {} hostname: {}", id, hostname);
                        record.set_hostname(hostname);
                        trace_stage(id, ProbeStage::RedirectKnown);
                    }
                    Ok(None) => {}
                    Err(e) => trace_failure(id, ProbeStage::RedirectKnown, &e),
                }
            }
            Err(e) => tracing::debug!("Instance {}: no API client: {}", id, e),
        }

        if let Some(ref geo) = self.geo {
            let style = self.settings.geolocation.style;
            match cancellable(cancel, locate(geo, style, ip)).await? {
                Ok(location) => {
                    record.set_location(location);
                    trace_stage(id, ProbeStage::LocationKnown);
                }
                Err(e) => trace_failure(id, ProbeStage::LocationKnown, &e),
            }
        }

        trace_stage(id, ProbeStage::Done);
        Some(record)
    }

    async fn check_liveness(&self, id: u64) -> Result<(), StageError> {
        let client = self
            .connector
            .connect(self.settings.liveness_transport(id))
            .map_err(StageError::Unreachable)?;

        let path = format!("/{}", self.settings.liveness_path.trim_start_matches('/'));
        let response = client.get(&path).await.map_err(StageError::Unreachable)?;

        if response.status == 200 {
            Ok(())
        } else {
            Err(StageError::HttpStatus(response.status))
        }
    }
}

/// Version from the help manifest, falling back to the legacy path on 404.
/// A 403 means the API exists behind authentication.
async fn discover_version<T: Transport + ?Sized>(api: &T) -> Result<String, StageError> {
    let mut response = api
        .get(VERSION_PATH)
        .await
        .map_err(StageError::Unreachable)?;

    if response.status == 404 {
        response = api
            .get(LEGACY_VERSION_PATH)
            .await
            .map_err(StageError::Unreachable)?;
    }

    match response.status {
        200 => parse::extract_version(&response.body),
        403 => Ok(API_PROTECTED.to_string()),
        status => Err(StageError::HttpStatus(status)),
    }
}

/// Login hostname if the landing page redirects, `None` if it does not.
async fn discover_hostname<T: Transport + ?Sized>(api: &T) -> Result<Option<String>, StageError> {
    let response = api.get("").await.map_err(StageError::Unreachable)?;

    if response.redirected() {
        Ok(Some(parse::extract_hostname(&response.url)))
    } else {
        Ok(None)
    }
}

async fn locate<T: Transport + ?Sized>(
    geo: &T,
    style: GeoStyle,
    ip: IpAddr,
) -> Result<super::Location, StageError> {
    let response = geo
        .get(&style.path_for(&ip.to_string()))
        .await
        .map_err(|e| StageError::GeolocationUnavailable(e.to_string()))?;

    if response.status != 200 {
        return Err(StageError::GeolocationUnavailable(format!(
            "HTTP {}",
            response.status
        )));
    }

    parse::parse_location(style, &response.body)
}

/// Race `fut` against cancellation; `None` if cancelled first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

fn trace_stage(id: u64, stage: ProbeStage) {
    tracing::trace!(instance = id, %stage, "probe stage");
}

fn trace_failure(id: u64, stage: ProbeStage, error: &StageError) {
    tracing::debug!("Instance {} {}: {}", id, stage, error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::scanner::testing::{FakeConnector, FakeResolver, fixture_connector, fixture_resolver};
    use std::time::Duration;

    fn probe(
        connector: FakeConnector,
        resolver: FakeResolver,
    ) -> InstanceProbe<FakeConnector, FakeResolver> {
        InstanceProbe::new(
            Arc::new(ScanSettings::default()),
            Arc::new(connector),
            Arc::new(resolver),
        )
    }

    #[tokio::test]
    async fn test_dns_failure_is_terminal() {
        let connector = fixture_connector();
        let probe = probe(connector.clone(), fixture_resolver());

        let record = probe.run(0, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.id(), 0);
        assert_eq!(record.active(), Some(false));
        assert_eq!(record.ip_address(), None);
        assert_eq!(record.version(), None);
        assert_eq!(record.hostname(), None);
        assert!(record.location().is_none());
        // Only the geolocation client was built; no instance request was made.
        assert!(connector.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_inactive_with_ip() {
        let connector = fixture_connector();
        let probe = probe(connector.clone(), fixture_resolver());

        let record = probe.run(40, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.active(), Some(false));
        assert_eq!(record.ip_address(), Some("205.139.50.61"));
        assert_eq!(record.version(), None);
        assert_eq!(record.hostname(), None);
        assert!(record.location().is_none());
        assert_eq!(connector.requests(), vec!["https://cn40.awmdm.com/".to_string()]);
    }

    #[tokio::test]
    async fn test_liveness_uses_fast_fail_profile() {
        let connector = fixture_connector();
        let probe = probe(connector.clone(), fixture_resolver());
        probe.run(40, &CancellationToken::new()).await.unwrap();

        let liveness = connector
            .configs()
            .into_iter()
            .find(|c| c.host == "cn40.awmdm.com")
            .unwrap();
        assert_eq!(liveness.timeout, Duration::from_secs(2));
        assert_eq!(liveness.max_retries, 2);
    }

    #[tokio::test]
    async fn test_non_200_liveness_is_inactive() {
        let connector = FakeConnector::default()
            .route("https://cn41.awmdm.com/", Ok(FakeConnector::response(500, "")));
        let resolver = FakeResolver::default().with("cn41.awmdm.com", "10.1.1.41");
        let record = probe(connector, resolver)
            .run(41, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.active(), Some(false));
        assert_eq!(record.ip_address(), Some("10.1.1.41"));
    }

    #[tokio::test]
    async fn test_version_falls_back_to_legacy_path() {
        let record = probe(fixture_connector(), fixture_resolver())
            .run(114, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.active(), Some(true));
        assert_eq!(record.version(), Some("9.6"));
        // Landing page does not redirect.
        assert_eq!(record.hostname(), None);
    }

    #[tokio::test]
    async fn test_location_is_collected() {
        let record = probe(fixture_connector(), fixture_resolver())
            .run(138, &CancellationToken::new())
            .await
            .unwrap();
        let location = record.location().unwrap();
        assert_eq!(location.city, "Atlanta");
        assert_eq!(location.region, "Georgia");
        assert_eq!(location.country, "United States");
        // Version endpoint answers 500: unset, and nothing else is affected.
        assert_eq!(record.version(), None);
        assert!(record.is_active());
    }

    #[tokio::test]
    async fn test_protected_api_and_login_redirect() {
        let record = probe(fixture_connector(), fixture_resolver())
            .run(755, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.version(), Some(API_PROTECTED));
        assert_eq!(record.hostname(), Some("swtadmin.awmdm.com"));
        // Geolocation failed for this one; the other fields are still set.
        assert!(record.location().is_none());
    }

    #[tokio::test]
    async fn test_protected_legacy_endpoint() {
        let connector = FakeConnector::default()
            .route("https://cn756.awmdm.com/", Ok(FakeConnector::response(200, "ok")))
            .route(
                "https://cn756.awmdm.com/api/help/local.json",
                Ok(FakeConnector::response(404, "")),
            )
            .route(
                "https://cn756.awmdm.com/api/system/help/localjson",
                Ok(FakeConnector::response(403, "")),
            );
        let resolver = FakeResolver::default().with("cn756.awmdm.com", "10.1.7.56");
        let record = probe(connector, resolver)
            .run(756, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.version(), Some(API_PROTECTED));
    }

    #[tokio::test]
    async fn test_sso_redirect_keeps_full_url() {
        let record = probe(fixture_connector(), fixture_resolver())
            .run(814, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            record.hostname(),
            Some("https://nike.okta.com/login/default")
        );
    }

    #[tokio::test]
    async fn test_geolocation_can_be_disabled() {
        let mut settings = ScanSettings::default();
        settings.geolocation.enabled = false;
        let connector = fixture_connector();
        let probe = InstanceProbe::new(
            Arc::new(settings),
            Arc::new(connector.clone()),
            Arc::new(fixture_resolver()),
        );

        let record = probe.run(138, &CancellationToken::new()).await.unwrap();
        assert!(record.is_active());
        assert!(record.location().is_none());
        assert!(!connector.requests().iter().any(|r| r.contains("ip-api.com")));
    }

    #[tokio::test]
    async fn test_cancelled_probe_yields_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = probe(fixture_connector(), fixture_resolver())
            .run(138, &cancel)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_on_version_leaves_field_unset() {
        let connector = FakeConnector::default()
            .route("https://cn900.awmdm.com/", Ok(FakeConnector::response(200, "ok")))
            .route(
                "https://cn900.awmdm.com/api/help/local.json",
                Err(TransportError::Timeout),
            );
        let resolver = FakeResolver::default().with("cn900.awmdm.com", "10.9.0.0");
        let record = probe(connector, resolver)
            .run(900, &CancellationToken::new())
            .await
            .unwrap();
        assert!(record.is_active());
        assert_eq!(record.version(), None);
    }
}
