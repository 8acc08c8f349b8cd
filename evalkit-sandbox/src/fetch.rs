//! Network capability behind the sandbox's `fetch` binding

use crate::policy::NetworkPosture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Outbound request issued by a snippet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// Response handed back to the snippet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Host-side HTTP capability.
///
/// Called synchronously from interpreter threads.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, String>;
}

/// Fetcher backed by a blocking HTTP client.
///
/// The client and its connection pool are built on first use and shared by
/// every later fetch.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    // Only ever called from interpreter threads; the blocking client must not
    // be built inside an async context.
    fn client(&self) -> Result<&reqwest::blocking::Client, String> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(self.client.get_or_init(|| built))
    }
}

impl Drop for HttpFetcher {
    fn drop(&mut self) {
        // The owning evaluator is usually dropped on an async task; shut the
        // client's runtime down on a plain thread instead.
        if let Some(client) = self.client.take() {
            std::thread::spawn(move || drop(client));
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, String> {
        tracing::debug!(
            url = %request.url,
            method = %request.method,
            has_body = request.body.is_some(),
            "Fetching"
        );

        let client = self.client()?;
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| format!("Unsupported HTTP method: {}", request.method))?;

        let mut builder = client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .map_err(|e| format!("Fetch failed: {}", e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .map_err(|e| format!("Failed to read response: {}", e))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Enforces a network posture in front of another fetcher
#[derive(Clone)]
pub struct PolicyFetcher {
    posture: NetworkPosture,
    inner: Arc<dyn Fetcher>,
}

impl PolicyFetcher {
    pub fn new(posture: NetworkPosture, inner: Arc<dyn Fetcher>) -> Self {
        Self { posture, inner }
    }

    pub fn posture(&self) -> &NetworkPosture {
        &self.posture
    }
}

impl Fetcher for PolicyFetcher {
    fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, String> {
        match &self.posture {
            NetworkPosture::Blocked => {
                tracing::debug!(url = %request.url, "Fetch denied: network blocked");
                Err("Network access is blocked by security policy".to_string())
            }
            posture if !posture.allows(&request.url) => {
                let host = url::Url::parse(&request.url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| request.url.clone());
                tracing::debug!(url = %request.url, "Fetch denied: host not allow-listed");
                Err(format!(
                    "Network access to {} is not allowed by security policy",
                    host
                ))
            }
            _ => self.inner.fetch(request),
        }
    }
}

impl std::fmt::Debug for PolicyFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyFetcher")
            .field("posture", &self.posture)
            .finish_non_exhaustive()
    }
}
