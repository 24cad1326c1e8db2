//! In-memory resolver and transport used by the probe and orchestrator tests.

use crate::error::TransportError;
use crate::transport::{Connector, HttpResponse, Resolver, Transport, TransportConfig};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

type Route = Result<HttpResponse, TransportError>;

#[derive(Clone, Default)]
pub(crate) struct FakeResolver {
    hosts: Arc<HashMap<String, IpAddr>>,
    panicking: Arc<HashSet<String>>,
    hang_unknown: bool,
}

impl FakeResolver {
    pub(crate) fn with(mut self, host: &str, ip: &str) -> Self {
        Arc::make_mut(&mut self.hosts).insert(host.to_string(), ip.parse().unwrap());
        self
    }

    pub(crate) fn panicking(mut self, host: &str) -> Self {
        Arc::make_mut(&mut self.panicking).insert(host.to_string());
        self
    }

    /// Lookups of unknown hosts never complete.
    pub(crate) fn hanging(mut self) -> Self {
        self.hang_unknown = true;
        self
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        if self.panicking.contains(host) {
            panic!("resolver exploded for {}", host);
        }
        match self.hosts.get(host) {
            Some(ip) => Ok(*ip),
            None if self.hang_unknown => std::future::pending().await,
            None => Err(TransportError::DnsFailure {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            }),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    routes: Arc<HashMap<String, Route>>,
    requests: Arc<Mutex<Vec<String>>>,
    configs: Arc<Mutex<Vec<TransportConfig>>>,
}

impl FakeConnector {
    pub(crate) fn route(mut self, url: &str, outcome: Route) -> Self {
        Arc::make_mut(&mut self.routes).insert(url.to_string(), outcome);
        self
    }

    pub(crate) fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            body: body.to_string(),
            headers: HeaderMap::new(),
            url: String::new(),
            history: Vec::new(),
        }
    }

    pub(crate) fn redirect(from: &str, to: &str) -> HttpResponse {
        HttpResponse {
            url: to.to_string(),
            history: vec![from.to_string()],
            ..Self::response(200, "<html>login</html>")
        }
    }

    /// URLs requested so far, in order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn configs(&self) -> Vec<TransportConfig> {
        self.configs.lock().unwrap().clone()
    }
}

pub(crate) struct FakeClient {
    base: String,
    routes: Arc<HashMap<String, Route>>,
    requests: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for FakeClient {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        let path = if path.is_empty() { "/" } else { path };
        let url = format!("{}{}", self.base, path);
        self.requests.lock().unwrap().push(url.clone());

        match self.routes.get(&url) {
            Some(Ok(response)) => {
                let mut response = response.clone();
                if response.url.is_empty() {
                    response.url = url;
                }
                Ok(response)
            }
            Some(Err(e)) => Err(e.clone()),
            None => Ok(HttpResponse {
                url,
                ..FakeConnector::response(404, "not found")
            }),
        }
    }
}

impl Connector for FakeConnector {
    type Client = FakeClient;

    fn connect(&self, config: TransportConfig) -> Result<FakeClient, TransportError> {
        let base = config.base_url();
        self.configs.lock().unwrap().push(config);
        Ok(FakeClient {
            base,
            routes: Arc::clone(&self.routes),
            requests: Arc::clone(&self.requests),
        })
    }
}

const ATLANTA: &str = r#"{
    "status": "success", "country": "United States", "countryCode": "US",
    "region": "GA", "regionName": "Georgia", "city": "Atlanta",
    "lat": 33.749, "lon": -84.388, "isp": "Dynamic Network Services, Inc.",
    "as": "AS33517 Dynamic Network Services, Inc.", "query": "205.139.50.138"
}"#;

const UEM_MANIFEST: &str =
    r#"{"apis":[{"name":"system","products":["VMware Workspace ONE UEM;9.6"]}]}"#;

/// Resolver for the well-known fixture instances: 0 has no DNS record.
pub(crate) fn fixture_resolver() -> FakeResolver {
    FakeResolver::default()
        .with("cn40.awmdm.com", "205.139.50.61")
        .with("cn114.awmdm.com", "10.0.1.14")
        .with("cn138.awmdm.com", "205.139.50.138")
        .with("cn755.awmdm.com", "10.0.7.55")
        .with("cn814.awmdm.com", "10.0.8.14")
}

/// Responses for the fixture instances:
/// - 40 refuses connections
/// - 114 serves its version on the legacy path
/// - 138 geolocates to Atlanta
/// - 755 protects its API and redirects to a company login host
/// - 814 redirects to an SSO provider
pub(crate) fn fixture_connector() -> FakeConnector {
    FakeConnector::default()
        .route(
            "https://cn40.awmdm.com/",
            Err(TransportError::ConnectionRefused("connection refused".to_string())),
        )
        .route("https://cn114.awmdm.com/", Ok(FakeConnector::response(200, "ok")))
        .route(
            "https://cn114.awmdm.com/api/system/help/localjson",
            Ok(FakeConnector::response(200, UEM_MANIFEST)),
        )
        .route("https://cn138.awmdm.com/", Ok(FakeConnector::response(200, "ok")))
        .route(
            "https://cn138.awmdm.com/api/help/local.json",
            Ok(FakeConnector::response(500, "")),
        )
        .route(
            "http://ip-api.com/json/205.139.50.138",
            Ok(FakeConnector::response(200, ATLANTA)),
        )
        .route(
            "https://cn755.awmdm.com/",
            Ok(FakeConnector::redirect(
                "https://cn755.awmdm.com/",
                "https://swtadmin.awmdm.com/AirWatch/Login",
            )),
        )
        .route(
            "https://cn755.awmdm.com/api/help/local.json",
            Ok(FakeConnector::response(403, "")),
        )
        .route(
            "http://ip-api.com/json/10.0.7.55",
            Ok(FakeConnector::response(
                200,
                r#"{"status":"fail","message":"private range"}"#,
            )),
        )
        .route(
            "https://cn814.awmdm.com/",
            Ok(FakeConnector::redirect(
                "https://cn814.awmdm.com/",
                "https://nike.okta.com/login/default",
            )),
        )
}
