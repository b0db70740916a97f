use std::net::{IpAddr, SocketAddr};

use actix_http::header::{HeaderMap, HeaderName};
use actix_web::dev::ServiceRequest;
use actix_web::http::{Method, Version};

use crate::field::header_value;

/// Snapshot of the request taken before the wrapped service runs.
///
/// actix-web does not allow holding on to the `HttpRequest` while routing runs, so this owned copy
/// is what both middlewares hand to user callbacks, even after the handler panicked or failed.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: Method,
    version: Version,
    target: String,
    host: String,
    client_ip: String,
    headers: HeaderMap,
}

impl RequestInfo {
    pub(crate) fn capture(req: &ServiceRequest) -> Self {
        RequestInfo::with_headers(req, req.headers().clone())
    }

    /// Like [`capture`](Self::capture), keeping only the `name` header.
    pub(crate) fn capture_header(req: &ServiceRequest, name: &HeaderName) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(value) = req.headers().get(name) {
            headers.insert(name.clone(), value.clone());
        }
        RequestInfo::with_headers(req, headers)
    }

    fn with_headers(req: &ServiceRequest, headers: HeaderMap) -> Self {
        let (host, client_ip) = {
            let conn = req.connection_info();
            (
                conn.host().to_string(),
                conn.realip_remote_addr()
                    .map(strip_port)
                    .unwrap_or_default(),
            )
        };

        RequestInfo {
            method: req.method().clone(),
            version: req.version(),
            target: req.uri().to_string(),
            host,
            client_ip,
            headers,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Version of the HTTP protocol. Example: HTTP/1.1
    pub fn protocol(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "unknown",
        }
    }

    /// Request target exactly as received, query string included. Example: /search?q=actix
    pub fn path(&self) -> &str {
        &self.target
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Client address without port, honouring `Forwarded` and `X-Forwarded-For`.
    /// Empty when unknown.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Captured request headers. [`Recover`](crate::Recover) keeps only its request id header.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of a request header, `None` when missing, empty or not valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = HeaderName::try_from(name).ok()?;
        header_value(&self.headers, &name)
    }
}

fn strip_port(addr: &str) -> String {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }

    let trimmed = addr.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_capture_request() {
        let req = TestRequest::get()
            .uri("/search?q=actix")
            .insert_header(("host", "192.168.10.60:5252"))
            .insert_header(("user-agent", "AnHTTPClient"))
            .peer_addr("192.0.2.1:41234".parse().unwrap())
            .to_srv_request();

        let info = RequestInfo::capture(&req);

        assert_eq!(info.method(), &Method::GET);
        assert_eq!(info.protocol(), "HTTP/1.1");
        assert_eq!(info.path(), "/search?q=actix");
        assert_eq!(info.host(), "192.168.10.60:5252");
        assert_eq!(info.client_ip(), "192.0.2.1");
        assert_eq!(info.header("user-agent"), Some("AnHTTPClient"));
        assert_eq!(info.header("referer"), None);
    }

    #[test]
    fn test_capture_single_header() {
        let req = TestRequest::get()
            .uri("/panic?x=1")
            .insert_header(("user-agent", "AnHTTPClient"))
            .insert_header(("my-request-id", "31337"))
            .peer_addr("192.0.2.1:41234".parse().unwrap())
            .to_srv_request();

        let info = RequestInfo::capture_header(&req, &HeaderName::from_static("my-request-id"));

        assert_eq!(info.headers().len(), 1);
        assert_eq!(info.header("my-request-id"), Some("31337"));
        assert_eq!(info.header("user-agent"), None);
        assert_eq!(info.path(), "/panic?x=1");
        assert_eq!(info.client_ip(), "192.0.2.1");

        let info = RequestInfo::capture_header(&req, &HeaderName::from_static("x-request-id"));
        assert!(info.headers().is_empty());
    }

    #[test]
    fn test_client_ip_from_forwarded_for() {
        let req = TestRequest::get()
            .insert_header(("x-forwarded-for", "203.0.113.7"))
            .peer_addr("192.0.2.1:41234".parse().unwrap())
            .to_srv_request();

        let info = RequestInfo::capture(&req);
        assert_eq!(info.client_ip(), "203.0.113.7");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("192.0.2.1:8080"), "192.0.2.1");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_port("unknown"), "unknown");
    }
}
