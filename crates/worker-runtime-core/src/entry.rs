//! Application entry point and the request/response records it handles.
//!
//! Workers never know what the hosted application does. They hold an
//! assembled [`Application`] and call into an [`EntryPoint`] for three
//! things only: initialization, dispatching one request, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use worker_runtime_common::BoxError;

/// An assembled application.
///
/// The application is built once by the bootstrap step, persisted by the
/// bootstrap cache, and shared read-only by every worker.
pub trait Application: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Application for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The only surface a worker uses to run application code.
///
/// Implementations must be safe to call from every worker thread at once.
/// An `Err` or a panic from [`dispatch`](EntryPoint::dispatch) crashes the
/// calling worker; the pool replaces it.
pub trait EntryPoint: Send + Sync + 'static {
    /// The assembled application handed to every worker.
    type App: Application;

    /// Prepare per-worker state. Called on start and after every reload.
    fn initialize(&self, _app: &Self::App, _slot: usize) -> Result<(), BoxError> {
        Ok(())
    }

    /// Handle one request.
    fn dispatch(
        &self,
        app: &Self::App,
        ctx: &DispatchContext,
        request: Request,
    ) -> Result<Response, BoxError>;

    /// Release per-worker state. Called on stop and before every reload.
    fn teardown(&self, _app: &Self::App, _slot: usize) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Per-dispatch information passed to the entry point.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    slot: usize,
    request_number: u64,
    aborted: Arc<AtomicBool>,
}

impl DispatchContext {
    pub(crate) fn new(slot: usize, request_number: u64, aborted: Arc<AtomicBool>) -> Self {
        Self {
            slot,
            request_number,
            aborted,
        }
    }

    /// Context for calling an entry point outside a worker, e.g. in tests.
    ///
    /// The request number is 1 and the context is never aborted.
    pub fn detached(slot: usize) -> Self {
        Self::new(slot, 1, Arc::new(AtomicBool::new(false)))
    }

    /// Slot index of the worker running this dispatch.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Position of this request in the worker's current budget, starting at 1.
    pub fn request_number(&self) -> u64 {
        self.request_number
    }

    /// Returns `true` once the pool has given up waiting for this dispatch.
    ///
    /// Long-running handlers should poll this and return early.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Transport-neutral HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request URI (path and query)
    pub uri: String,
    /// Request headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

impl Request {
    /// Create a new request without headers or body.
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header to the request.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The URI path without the query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// Get a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Transport-neutral HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Create a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Create a simple text response.
    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, body).with_header("content-type", "text/plain; charset=utf-8")
    }

    /// Add a header to the response.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Get a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::text(200, "OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request() {
        let req = Request::new("GET", "/api/test?page=2");
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/api/test?page=2");
        assert_eq!(req.path(), "/api/test");
        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_get_header() {
        let req = Request::new("POST", "/").with_header("Content-Type", "application/json");

        assert_eq!(req.get_header("content-type"), Some("application/json"));
        assert_eq!(req.get_header("CONTENT-TYPE"), Some("application/json"));
        assert!(req.get_header("X-Missing").is_none());
    }

    #[test]
    fn test_text_response() {
        let resp = Response::text(404, "missing");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, b"missing");
        assert_eq!(
            resp.get_header("Content-Type"),
            Some("text/plain; charset=utf-8")
        );
    }

    #[test]
    fn test_dispatch_context_abort_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = DispatchContext::new(2, 7, Arc::clone(&flag));

        assert_eq!(ctx.slot(), 2);
        assert_eq!(ctx.request_number(), 7);
        assert!(!ctx.is_aborted());

        flag.store(true, Ordering::Release);
        assert!(ctx.is_aborted());
    }
}
