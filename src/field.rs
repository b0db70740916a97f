use std::{borrow::Cow, time::Duration};

use actix_http::header::HeaderMap;
use actix_web::http::header::HeaderName;
use log::kv::{ToValue, Value};

/// Header used to correlate requests when no custom one is configured.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

/// One structured key/value pair of a log record.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_kvlog::Field;
///
/// let field = Field::new("tenant", "acme");
/// assert_eq!(field.key(), "tenant");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    key: Cow<'static, str>,
    value: FieldValue,
}

impl Field {
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<FieldValue>) -> Self {
        Field {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }
}

/// Typed value of a [`Field`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Text. Example: GET
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer. Example: 200
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// Elapsed time, rendered with its `Debug` form. Example: 1.25ms
    Duration(Duration),
}

impl ToValue for FieldValue {
    fn to_value(&self) -> Value<'_> {
        match self {
            FieldValue::Str(v) => Value::from(v.as_str()),
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::UInt(v) => Value::from(*v),
            FieldValue::Float(v) => Value::from(*v),
            FieldValue::Bool(v) => Value::from(*v),
            FieldValue::Duration(v) => Value::from_debug(v),
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::UInt(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Duration> for FieldValue {
    fn from(v: Duration) -> Self {
        FieldValue::Duration(v)
    }
}

/// Value of `name` in `headers`; missing, empty and non UTF-8 values count as absent.
pub(crate) fn header_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Request id from the request headers, falling back to the response headers.
pub(crate) fn resolve_request_id(
    header: &HeaderName,
    request: &HeaderMap,
    response: Option<&HeaderMap>,
) -> Option<String> {
    header_value(request, header)
        .or_else(|| response.and_then(|headers| header_value(headers, header)))
        .map(str::to_string)
}

/// Referer from the response headers, falling back to the request headers.
pub(crate) fn resolve_referer(request: &HeaderMap, response: Option<&HeaderMap>) -> Option<String> {
    let name = actix_web::http::header::REFERER;
    response
        .and_then(|headers| header_value(headers, &name))
        .or_else(|| header_value(request, &name))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderValue, REFERER};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(k, v) in pairs {
            map.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_request_id_prefers_request() {
        let header = HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER);
        let req = headers(&[("x-request-id", "from-request")]);
        let res = headers(&[("x-request-id", "from-response")]);

        assert_eq!(
            resolve_request_id(&header, &req, Some(&res)),
            Some("from-request".to_string())
        );
        assert_eq!(
            resolve_request_id(&header, &HeaderMap::new(), Some(&res)),
            Some("from-response".to_string())
        );
        assert_eq!(resolve_request_id(&header, &HeaderMap::new(), None), None);
    }

    #[test]
    fn test_empty_request_id_is_absent() {
        let header = HeaderName::from_static("my-request-id");
        let req = headers(&[("my-request-id", "")]);

        assert_eq!(resolve_request_id(&header, &req, None), None);
    }

    #[test]
    fn test_referer_prefers_response() {
        let req = headers(&[("referer", "http://request.example")]);
        let mut res = HeaderMap::new();
        res.insert(REFERER, HeaderValue::from_static("http://response.example"));

        assert_eq!(
            resolve_referer(&req, Some(&res)),
            Some("http://response.example".to_string())
        );
        assert_eq!(
            resolve_referer(&req, None),
            Some("http://request.example".to_string())
        );
        assert_eq!(resolve_referer(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_field_value_to_kv() {
        let status = FieldValue::from(418u16);
        assert_eq!(status.to_value().to_u64(), Some(418));

        let flag = FieldValue::from(true);
        assert_eq!(flag.to_value().to_bool(), Some(true));

        let text = FieldValue::from("hello");
        assert_eq!(text.to_value().to_string(), "hello");

        let latency = FieldValue::from(Duration::from_millis(5));
        assert_eq!(latency.to_value().to_string(), "5ms");
    }
}
