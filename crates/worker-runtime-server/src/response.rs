//! HTTP response conversion from worker dispatch.
//!
//! Converts the [`Response`] produced by a worker back into an axum
//! response, and builds the JSON error bodies the server emits itself.

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;

use worker_runtime_core::Response;

/// Convert a worker response to an axum response.
///
/// An out-of-range status becomes `500`. Headers that are not valid HTTP
/// are dropped.
pub fn into_axum_response(response: Response) -> axum::response::Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut out = axum::response::Response::new(Body::from(response.body));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }

    out
}

/// Create an error response with a JSON body.
pub fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_axum_response() {
        let resp = Response::text(201, "Hello").with_header("X-Custom", "value");
        let axum_resp = into_axum_response(resp);

        assert_eq!(axum_resp.status(), StatusCode::CREATED);
        assert_eq!(axum_resp.headers()["x-custom"], "value");
        assert_eq!(
            axum_resp.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_repeated_headers_are_kept() {
        let resp = Response::new(200, "")
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2");
        let axum_resp = into_axum_response(resp);

        assert_eq!(axum_resp.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_invalid_status_and_header() {
        let resp = Response::new(1000, "").with_header("bad header", "x");
        let axum_resp = into_axum_response(resp);

        assert_eq!(axum_resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(axum_resp.headers().is_empty());
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::NOT_FOUND, "Not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["content-type"], "application/json");
    }
}
