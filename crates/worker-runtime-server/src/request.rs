//! HTTP request conversion for worker dispatch.
//!
//! Converts an axum request into the transport-neutral [`Request`]
//! record handed to the worker pool.

use axum::http::Request as HttpRequest;
use bytes::Bytes;

use worker_runtime_core::Request;

/// Largest request body forwarded to a worker.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Convert from axum request parts.
///
/// Headers whose values are not valid UTF-8 are dropped.
///
/// # Arguments
///
/// * `req` - The HTTP request (headers and metadata)
/// * `body` - The request body as bytes
pub fn from_axum<B>(req: &HttpRequest<B>, body: Bytes) -> Request {
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    Request {
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        headers,
        body: body.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method};

    #[test]
    fn test_from_axum() {
        let http_req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/api/users?page=2")
            .header("Content-Type", "application/json")
            .header("X-Request-Id", "123")
            .body(())
            .unwrap();

        let body = Bytes::from(r#"{"name": "test"}"#);
        let req = from_axum(&http_req, body);

        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/api/users?page=2");
        assert_eq!(req.path(), "/api/users");
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.get_header("content-type"), Some("application/json"));
        assert_eq!(req.body, br#"{"name": "test"}"#);
    }

    #[test]
    fn test_from_axum_skips_opaque_headers() {
        let mut http_req = HttpRequest::builder().uri("/").body(()).unwrap();
        http_req.headers_mut().insert(
            "x-binary",
            HeaderValue::from_bytes(&[0xfa, 0xfb]).unwrap(),
        );

        let req = from_axum(&http_req, Bytes::new());

        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
        assert_eq!(req.method, "GET");
    }
}
