//! HTTP client shared by HTTP-based modules
//!
//! Wraps `reqwest` with the option set modules expose to users: basic and
//! bearer auth, extra headers, proxy, redirect policy, TLS, per-request
//! timeout, retries and a cap on concurrent requests.

use super::tls::TlsConfig;
use crate::config::decode;
use crate::error::{CollectorError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Pause between retries, multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_connections() -> usize {
    10
}

/// HTTP options of a module
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
    #[serde(default = "default_timeout", with = "decode::duration")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub not_follow_redirects: bool,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            bearer_token: None,
            headers: HashMap::new(),
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            max_connections: default_max_connections(),
            not_follow_redirects: false,
            tls: TlsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| CollectorError::config(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CollectorError::config(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(CollectorError::config(
                "username and password must be set together",
            ));
        }
        if self.proxy_username.is_some() != self.proxy_password.is_some() {
            return Err(CollectorError::config(
                "proxy_username and proxy_password must be set together",
            ));
        }
        if self.timeout.is_zero() {
            return Err(CollectorError::config("timeout must be positive"));
        }
        if self.max_connections == 0 {
            return Err(CollectorError::config("max_connections must be positive"));
        }
        Ok(url)
    }
}

/// A request relative to the client's base URL
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: reqwest::Method::POST,
            body: Some(body.into()),
            ..Self::get(path)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful response; the body can be consumed once
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn text(self) -> Result<String> {
        String::from_utf8(self.body)
            .map_err(|e| CollectorError::protocol(format!("response is not UTF-8: {e}")))
    }

    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a request.
    ///
    /// 401/403 map to `Auth`, 5xx (after retries) to `Unavailable`, other
    /// non-2xx statuses to `Protocol`.
    async fn execute(&self, cancel: &CancellationToken, request: HttpRequest) -> Result<HttpResponse>;
}

enum Attempt {
    Done(HttpResponse),
    Retry(CollectorError),
    Fail(CollectorError),
}

/// [`HttpClient`] backed by reqwest
pub struct ReqwestClient {
    client: reqwest::Client,
    base: Url,
    config: HttpConfig,
    permits: Arc<Semaphore>,
}

impl ReqwestClient {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let base = config.validate()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CollectorError::config(format!("invalid header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CollectorError::config(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections)
            .default_headers(headers);

        if config.not_follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }

        // Proxies come from job options only, never from the environment.
        match &config.proxy_url {
            Some(proxy_url) => {
                let mut proxy = reqwest::Proxy::all(proxy_url)
                    .map_err(|e| CollectorError::config(format!("invalid proxy_url: {e}")))?;
                if let (Some(user), Some(pass)) = (&config.proxy_username, &config.proxy_password)
                {
                    proxy = proxy.basic_auth(user, pass);
                }
                builder = builder.proxy(proxy);
            }
            None => builder = builder.no_proxy(),
        }

        if !config.tls.is_default() {
            let tls = config
                .tls
                .client_config()
                .map_err(|e| CollectorError::config(format!("{e:#}")))?;
            builder = builder.use_preconfigured_tls(tls);
        }

        let client = builder
            .build()
            .map_err(|e| CollectorError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn attempt(&self, url: &Url, request: &HttpRequest) -> Attempt {
        let mut builder = self.client.request(request.method.clone(), url.clone());
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Attempt::Retry(CollectorError::Timeout(self.config.timeout)),
            Err(e) => return Attempt::Retry(CollectorError::unavailable(format!("{url}: {e}"))),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Attempt::Fail(CollectorError::Auth(format!("{url}: {status}")));
        }
        if status.is_server_error() {
            return Attempt::Retry(CollectorError::unavailable(format!("{url}: {status}")));
        }
        if !status.is_success() {
            return Attempt::Fail(CollectorError::protocol(format!("{url}: unexpected {status}")));
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        match response.bytes().await {
            Ok(body) => Attempt::Done(HttpResponse {
                status: status.as_u16(),
                headers,
                body: body.to_vec(),
            }),
            Err(e) => Attempt::Retry(CollectorError::unavailable(format!("{url}: reading body: {e}"))),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, cancel: &CancellationToken, request: HttpRequest) -> Result<HttpResponse> {
        let url = self
            .base
            .join(&request.path)
            .map_err(|e| CollectorError::config(format!("invalid path '{}': {}", request.path, e)))?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| CollectorError::internal("HTTP client closed"))?,
        };

        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                outcome = self.attempt(&url, &request) => outcome,
            };

            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(err) => return Err(err),
                Attempt::Retry(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(url = %url, attempt, error = %err, "Retrying HTTP request");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                        _ = tokio::time::sleep(RETRY_BACKOFF * attempt) => {}
                    }
                }
                Attempt::Retry(err) => return Err(err),
            }
        }
    }
}
