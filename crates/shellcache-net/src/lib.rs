//! # ShellCache Net
//!
//! Request/response model and network fetchers used by the ShellCache worker.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: everything that touches the network goes through the
//!    [`Fetcher`] trait, so the worker can run against a real origin or an
//!    in-memory route table.
//! 2. **Browser-like responses**: responses carry a [`ResponseType`] and a
//!    `redirected` flag, which is what the cache uses to decide whether a
//!    response may be stored.
//! 3. **Cache modes**: `CacheMode::Reload` bypasses intermediate HTTP caches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::{Origin, Url};

pub mod route;

pub use route::RouteFetcher;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring the fetch standard's modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin sub-resource.
    #[default]
    SameOrigin,
    /// Cross-origin without CORS (opaque response).
    NoCors,
    /// Cross-origin with CORS.
    Cors,
}

/// How the request interacts with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Do not store the response in any HTTP cache.
    NoStore,
    /// Bypass HTTP caches and revalidate with the origin.
    Reload,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl Request {
    /// Create a GET request for a sub-resource.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::SameOrigin,
            cache: CacheMode::Default,
        }
    }

    /// Create a navigation request (a top-level document load).
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cache mode.
    pub fn cache_mode(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Whether this request loads a top-level document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Normalized key used to match this request against a cache.
    ///
    /// Fragments never reach the server, so they are not part of the key.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

/// Response type, mirroring the fetch standard's response tainting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response shared through CORS.
    Cors,
    /// Cross-origin response whose content is not readable.
    Opaque,
    /// Synthesized network error.
    Error,
}

/// HTTP response.
///
/// Bodies are [`Bytes`], so cloning a response to store a copy is cheap.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub redirected: bool,
}

impl Response {
    /// Create a same-origin response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            redirected: false,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether this response may be written to a cache generation.
    ///
    /// Only a plain 200 from the same origin that was not reached through a
    /// redirect qualifies.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
            && self.response_type == ResponseType::Basic
            && !self.redirected
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::InvalidBody(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::InvalidBody(e.to_string()))
    }
}

/// Anything that can perform a network fetch.
///
/// `Ok` carries every response the server produced, 404s included; `Err` is
/// reserved for fetches that threw (offline, DNS, connection reset).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Whole-request timeout. `None` leaves requests to the platform's own
    /// limits.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("ShellCache/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: None,
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by `reqwest`.
///
/// Responses whose final URL shares the configured origin are classified as
/// [`ResponseType::Basic`]; everything else is [`ResponseType::Opaque`].
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for pages served from `origin`.
    pub fn new(origin: &Url, config: FetcherConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %origin, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin: origin.origin(),
        })
    }

    fn classify(&self, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.origin {
            ResponseType::Basic
        } else {
            ResponseType::Opaque
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, cache = ?request.cache, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header(header::ACCEPT_LANGUAGE, &self.config.accept_language);

        match request.cache {
            CacheMode::Default => {}
            CacheMode::NoStore => {
                req_builder = req_builder.header(header::CACHE_CONTROL, "no-store");
            }
            CacheMode::Reload => {
                req_builder = req_builder
                    .header(header::CACHE_CONTROL, "no-cache")
                    .header(header::PRAGMA, "no-cache");
            }
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;
        let response_type = self.classify(&url);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
            response_type,
            redirected,
        })
    }
}
