//! Synthesized responses for requests that fail both from cache and network.

use http::{header, HeaderName, HeaderValue, StatusCode};
use shellcache_net::Response;
use url::Url;

/// Header marking a synthesized offline response.
pub const OFFLINE_FALLBACK_HEADER: &str = "x-shellcache-fallback";

const FALLBACK_VALUE: &str = "offline";

/// The offline document and the offline resource response.
#[derive(Debug, Clone)]
pub struct OfflinePage {
    title: String,
}

impl OfflinePage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    /// Self-contained HTML document. Reloads itself once the browser reports
    /// connectivity again.
    pub fn html(&self) -> String {
        let title = escape_html(&self.title);
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
body {{ font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f5f5f5; color: #333; }}
main {{ text-align: center; padding: 2rem; }}
button {{ margin-top: 1rem; padding: .6rem 1.4rem; border: 0; border-radius: 4px; background: #1976d2; color: #fff; cursor: pointer; }}
</style>
</head>
<body>
<main>
<h1>{title}</h1>
<p>Check your connection. This page reloads automatically when you are back online.</p>
<button type="button" onclick="location.reload()">Reload</button>
</main>
<script>window.addEventListener('online', function () {{ location.reload(); }});</script>
</body>
</html>
"#
        )
    }

    /// Status 200 offline document for a failed navigation.
    pub fn navigation_response(&self, url: &Url) -> Response {
        Response::new(url.clone(), StatusCode::OK, self.html())
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            )
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
            .with_header(
                HeaderName::from_static(OFFLINE_FALLBACK_HEADER),
                HeaderValue::from_static(FALLBACK_VALUE),
            )
    }

    /// Status 503 plain-text response for a failed sub-resource.
    pub fn resource_response(&self, url: &Url) -> Response {
        Response::new(url.clone(), StatusCode::SERVICE_UNAVAILABLE, "Offline")
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
            .with_header(
                HeaderName::from_static(OFFLINE_FALLBACK_HEADER),
                HeaderValue::from_static(FALLBACK_VALUE),
            )
    }
}

impl Default for OfflinePage {
    fn default() -> Self {
        Self::new("You are offline")
    }
}

/// Whether `response` was synthesized by [`OfflinePage`].
pub fn is_offline_fallback(response: &Response) -> bool {
    response.header(OFFLINE_FALLBACK_HEADER) == Some(FALLBACK_VALUE)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://app.example.com/admin/").unwrap()
    }

    #[test]
    fn test_navigation_response_is_html_200() {
        let response = OfflinePage::default().navigation_response(&url());
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type().unwrap().essence_str(), "text/html");
        assert!(is_offline_fallback(&response));

        let body = response.text().unwrap();
        assert!(body.contains("You are offline"));
        assert!(body.contains("addEventListener('online'"));
        assert!(body.contains("location.reload()"));
    }

    #[test]
    fn test_resource_response_is_503() {
        let response = OfflinePage::default().resource_response(&url());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.content_type().unwrap().essence_str(), "text/plain");
        assert!(!response.is_cacheable());
    }

    #[test]
    fn test_title_is_escaped() {
        let html = OfflinePage::new("<b>Down</b>").html();
        assert!(html.contains("&lt;b&gt;Down&lt;/b&gt;"));
        assert!(!html.contains("<b>Down"));
    }

    #[test]
    fn test_plain_response_is_not_fallback() {
        let response = Response::new(url(), StatusCode::OK, "<html/>");
        assert!(!is_offline_fallback(&response));
    }
}
