//! In-memory route table implementing [`Fetcher`].
//!
//! Serves canned responses for an origin with no sockets involved. It can be
//! switched offline, can make single routes throw, and counts every fetch, which
//! makes it the fetcher of choice for offline demos and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{CacheMode, Fetcher, NetError, Request, Response, ResponseType};

#[derive(Debug, Clone)]
struct Route {
    response: Response,
    fail: bool,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct FetchLog {
    counts: HashMap<String, usize>,
    cache_modes: HashMap<String, Vec<CacheMode>>,
}

/// A [`Fetcher`] answering from a fixed route table.
///
/// Routes are keyed by absolute URL without fragment. A lookup that misses
/// retries without the query string, then falls back to a 404.
pub struct RouteFetcher {
    origin: Url,
    routes: RwLock<HashMap<String, Route>>,
    online: AtomicBool,
    log: RwLock<FetchLog>,
}

impl RouteFetcher {
    /// Create an empty route table for `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            log: RwLock::new(FetchLog::default()),
        }
    }

    /// The origin relative paths are resolved against.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn key_for(&self, path: &str) -> String {
        let mut url = self
            .origin
            .join(path)
            .unwrap_or_else(|_| self.origin.clone());
        url.set_fragment(None);
        url.into()
    }

    fn content_type_for(path: &str) -> &'static str {
        let ext = path.rsplit('.').next().unwrap_or_default();
        match ext {
            "html" => "text/html; charset=utf-8",
            "js" => "application/javascript",
            "css" => "text/css",
            "json" => "application/json",
            "png" => "image/png",
            "ico" => "image/x-icon",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }

    /// Builder form of [`RouteFetcher::serve`].
    pub fn with_route(mut self, path: &str, status: u16, body: impl Into<Bytes>) -> Self {
        let route = self.build_route(path, status, body.into());
        let key = self.key_for(path);
        self.routes.get_mut().insert(key, route);
        self
    }

    fn build_route(&self, path: &str, status: u16, body: Bytes) -> Route {
        let url = Url::parse(&self.key_for(path)).unwrap_or_else(|_| self.origin.clone());
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let response = Response::new(url, status, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static(Self::content_type_for(path)),
        );
        Route {
            response,
            fail: false,
            delay: None,
        }
    }

    /// Serve `body` with `status` at `path` (relative to the origin or absolute).
    pub async fn serve(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        let route = self.build_route(path, status, body.into());
        self.routes.write().await.insert(self.key_for(path), route);
    }

    /// Serve an arbitrary response at `path`.
    pub async fn serve_response(&self, path: &str, response: Response) {
        let route = Route {
            response,
            fail: false,
            delay: None,
        };
        self.routes.write().await.insert(self.key_for(path), route);
    }

    /// Make fetches of `path` throw, as a connection reset would.
    pub async fn fail(&self, path: &str) {
        let key = self.key_for(path);
        let mut routes = self.routes.write().await;
        match routes.get_mut(&key) {
            Some(route) => route.fail = true,
            None => {
                let mut route = self.build_route(path, 200, Bytes::new());
                route.fail = true;
                routes.insert(key, route);
            }
        }
    }

    /// Delay every fetch of `path` by `delay`.
    pub async fn delay(&self, path: &str, delay: Duration) {
        if let Some(route) = self.routes.write().await.get_mut(&self.key_for(path)) {
            route.delay = Some(delay);
        }
    }

    /// Switch the whole network on or off.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of fetches issued for `path`, including failed ones.
    pub async fn fetch_count(&self, path: &str) -> usize {
        let key = self.key_for(path);
        self.log.read().await.counts.get(&key).copied().unwrap_or(0)
    }

    /// Total number of fetches issued.
    pub async fn total_fetches(&self) -> usize {
        self.log.read().await.counts.values().sum()
    }

    /// Cache modes of every fetch issued for `path`, in order.
    pub async fn cache_modes(&self, path: &str) -> Vec<CacheMode> {
        let key = self.key_for(path);
        self.log
            .read()
            .await
            .cache_modes
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    async fn lookup(&self, key: &str, url: &Url) -> Option<Route> {
        let routes = self.routes.read().await;
        if let Some(route) = routes.get(key) {
            return Some(route.clone());
        }
        let mut bare = url.clone();
        bare.set_query(None);
        bare.set_fragment(None);
        routes.get(bare.as_str()).cloned()
    }
}

#[async_trait]
impl Fetcher for RouteFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let key = request.cache_key();
        {
            let mut log = self.log.write().await;
            *log.counts.entry(key.clone()).or_insert(0) += 1;
            log.cache_modes
                .entry(key.clone())
                .or_default()
                .push(request.cache);
        }

        if !self.is_online() {
            trace!(url = %request.url, "Route fetch while offline");
            return Err(NetError::Offline);
        }

        let Some(route) = self.lookup(&key, &request.url).await else {
            trace!(url = %request.url, "No route, answering 404");
            return Ok(Response::new(request.url, StatusCode::NOT_FOUND, Bytes::new()));
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }

        if route.fail {
            return Err(NetError::RequestFailed(format!(
                "connection reset for {}",
                request.url
            )));
        }

        let mut response = route.response;
        if response.url.origin() != self.origin.origin() {
            response.response_type = ResponseType::Opaque;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    #[tokio::test]
    async fn test_serves_registered_route() {
        let fetcher = RouteFetcher::new(origin()).with_route("/index.html", 200, "<html/>");

        let request = Request::get(origin().join("/index.html").unwrap());
        let response = fetcher.fetch(request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "<html/>");
        assert_eq!(
            response.header("content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(fetcher.fetch_count("/index.html").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let fetcher = RouteFetcher::new(origin());
        let response = fetcher
            .fetch(Request::get(origin().join("/nope").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_falls_back_to_bare_route() {
        let fetcher = RouteFetcher::new(origin()).with_route("/sw.json", 200, "{}");
        let response = fetcher
            .fetch(Request::get(origin().join("/sw.json?v=3&t=17").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_offline_throws() {
        let fetcher = RouteFetcher::new(origin()).with_route("/a.js", 200, "a");
        fetcher.set_online(false);

        let result = fetcher
            .fetch(Request::get(origin().join("/a.js").unwrap()))
            .await;
        assert!(matches!(result, Err(NetError::Offline)));
        assert_eq!(fetcher.fetch_count("/a.js").await, 1);

        fetcher.set_online(true);
        assert!(fetcher
            .fetch(Request::get(origin().join("/a.js").unwrap()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failing_route_throws() {
        let fetcher = RouteFetcher::new(origin()).with_route("/a.js", 200, "a");
        fetcher.fail("/a.js").await;
        let result = fetcher
            .fetch(Request::get(origin().join("/a.js").unwrap()))
            .await;
        assert!(matches!(result, Err(NetError::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_cross_origin_route_is_opaque() {
        let fetcher =
            RouteFetcher::new(origin()).with_route("https://cdn.example.net/lib.js", 200, "lib");
        let response = fetcher
            .fetch(Request::parse("https://cdn.example.net/lib.js").unwrap())
            .await
            .unwrap();
        assert_eq!(response.response_type, ResponseType::Opaque);
    }

    #[tokio::test]
    async fn test_records_cache_modes() {
        let fetcher = RouteFetcher::new(origin()).with_route("/a.js", 200, "a");
        let url = origin().join("/a.js").unwrap();
        fetcher.fetch(Request::get(url.clone())).await.unwrap();
        fetcher
            .fetch(Request::get(url).cache_mode(CacheMode::Reload))
            .await
            .unwrap();

        assert_eq!(
            fetcher.cache_modes("/a.js").await,
            vec![CacheMode::Default, CacheMode::Reload]
        );
    }
}
