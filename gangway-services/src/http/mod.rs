//! HTTP plumbing shared by the edge (inbound) and upstream (outbound) seams.
//!
//! Connections are served by hyper over an in-memory duplex pipe
//! ([`bridge`]); [`body::ProxyBody`] is the single body type flowing through
//! the proxy in both directions.
use http::{header, HeaderValue, Request, Response, StatusCode};

pub mod body;
pub mod bridge;
pub mod copy;
pub mod edge;

pub use body::{BodyError, ProxyBody};
pub use edge::EdgeConnService;

pub(crate) const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub(crate) const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub(crate) const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// An empty-body response with the given status.
pub fn generate_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, HeaderValue::from_static("0"))
        .body(ProxyBody::empty())
        .unwrap()
}

/// An html response, used for rendered error pages.
pub fn html_response(status: StatusCode, html: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .body(ProxyBody::from_bytes(html.into()))
        .unwrap()
}

/// Permanent redirect of the same request onto https.
pub fn redirect_to_https<B>(req: &Request<B>) -> Response<ProxyBody> {
    let host = request_host(req).unwrap_or_default();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");
    match HeaderValue::from_str(&location) {
        Ok(value) => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, value)
            .header(header::CONTENT_LENGTH, HeaderValue::from_static("0"))
            .body(ProxyBody::empty())
            .unwrap(),
        Err(_) => generate_response(StatusCode::BAD_REQUEST),
    }
}

/// The request host, lowercased and with any port stripped.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })?;
    let raw = raw.trim();
    // v6 literals keep their brackets, ports are cut at the last colon.
    let host = if raw.starts_with('[') {
        raw.split(']').next().map(|h| format!("{h}]")).unwrap_or_default()
    } else {
        raw.rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| raw.to_string())
    };
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Whether the request asks for a protocol upgrade (websocket et al).
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(header::UPGRADE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/some/path?q=1")
            .header(header::HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn host_strips_port_and_case() {
        assert_eq!(
            request_host(&req_with_host("Example.COM:8443")).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            request_host(&req_with_host("example.com")).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let mut req = req_with_host("example.com");
        assert!(!is_upgrade_request(&req));
        req.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        req.headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&req));
    }

    #[test]
    fn https_redirect_keeps_path_and_query() {
        let resp = redirect_to_https(&req_with_host("example.com"));
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://example.com/some/path?q=1"
        );
    }
}
