use super::{HttpResponse, Transport, TransportConfig};
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, Url};

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
enum RequestBody {
    Json(Vec<u8>),
    Raw(Vec<u8>),
}

/// HTTP(S) client bound to one host.
///
/// Keeps a single connection pool for its lifetime, follows redirects itself
/// so the chain can be reported, and retries transient failures with
/// exponential backoff before handing the final outcome to the caller.
#[derive(Debug, Clone)]
pub struct TransportClient {
    config: TransportConfig,
    base_url: String,
    http: reqwest::Client,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let base_url = config.base_url();
        Url::parse(&base_url)
            .map_err(|e| TransportError::Other(format!("invalid base URL {}: {}", base_url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| {
                    TransportError::Other(format!("invalid header name {}: {}", name, e))
                })?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Other(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(ref proxy) = config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| TransportError::Other(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(TransportError::from_reqwest)?;

        if config.debug {
            tracing::debug!(
                "Transport client for {} (timeout {:?}, retries {})",
                base_url,
                config.timeout,
                config.max_retries
            );
        }

        Ok(Self {
            config,
            base_url,
            http,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.execute(Method::GET, path, None).await
    }

    /// POST a JSON payload. Never retried.
    pub async fn post(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| TransportError::Other(format!("failed to encode payload: {}", e)))?;
        self.execute(Method::POST, path, Some(RequestBody::Json(body)))
            .await
    }

    pub async fn put(
        &self,
        path: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<HttpResponse, TransportError> {
        self.execute(Method::PUT, path, Some(RequestBody::Raw(payload.into())))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.execute(Method::DELETE, path, None).await
    }

    /// GET `path` and keep only the response headers.
    pub async fn headers(&self, path: &str) -> Result<HeaderMap, TransportError> {
        Ok(self.get(path).await?.headers)
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        let raw = if path.is_empty() || path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&raw).map_err(|e| TransportError::Other(format!("invalid URL {}: {}", raw, e)))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
    ) -> Result<HttpResponse, TransportError> {
        let url = self.url_for(path)?;
        let retryable = is_idempotent(&method);
        let mut attempt = 0;

        loop {
            let outcome = self.follow(method.clone(), url.clone(), body.clone()).await;

            let wants_retry = match &outcome {
                Ok(response) => self.config.retry_statuses.contains(&response.status),
                Err(e) => e.is_transient(),
            };
            if !retryable || !wants_retry || attempt >= self.config.max_retries {
                return outcome;
            }

            let delay = self.config.backoff_delay(attempt);
            match &outcome {
                Ok(response) => tracing::debug!(
                    "{} {} returned {}, retrying in {:?} ({}/{})",
                    method,
                    url,
                    response.status,
                    delay,
                    attempt + 1,
                    self.config.max_retries
                ),
                Err(e) => tracing::debug!(
                    "{} {} failed: {}, retrying in {:?} ({}/{})",
                    method,
                    url,
                    e,
                    delay,
                    attempt + 1,
                    self.config.max_retries
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Send one request and follow its redirect chain.
    async fn follow(
        &self,
        mut method: Method,
        mut url: Url,
        mut body: Option<RequestBody>,
    ) -> Result<HttpResponse, TransportError> {
        let mut history = Vec::new();

        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            match &body {
                Some(RequestBody::Json(bytes)) => {
                    request = request
                        .header(CONTENT_TYPE, "application/json")
                        .body(bytes.clone());
                }
                Some(RequestBody::Raw(bytes)) => {
                    request = request.body(bytes.clone());
                }
                None => {}
            }

            if self.config.debug {
                tracing::debug!("--> {} {}", method, url);
            }

            let response = request.send().await.map_err(TransportError::from_reqwest)?;
            let status = response.status();

            if self.config.debug {
                tracing::debug!("<-- {} {}", status.as_u16(), url);
            }

            if status.is_redirection() {
                if let Some(next) = redirect_target(&url, response.headers()) {
                    if history.len() >= MAX_REDIRECTS {
                        return Err(TransportError::Other(format!(
                            "too many redirects starting at {}",
                            history.first().map(String::as_str).unwrap_or(url.as_str())
                        )));
                    }
                    history.push(url.to_string());
                    if matches!(status.as_u16(), 301..=303) && method != Method::HEAD {
                        method = Method::GET;
                        body = None;
                    }
                    url = next;
                    continue;
                }
            }

            let headers = response.headers().clone();
            let text = response.text().await.map_err(TransportError::from_reqwest)?;

            return Ok(HttpResponse {
                status: status.as_u16(),
                body: text,
                headers,
                url: url.to_string(),
                history,
            });
        }
    }
}

#[async_trait]
impl Transport for TransportClient {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        TransportClient::get(self, path).await
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}
