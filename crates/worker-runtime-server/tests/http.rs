//! End-to-end tests over a real TCP listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use worker_runtime_common::{BoxError, PoolStatus, RuntimeConfig};
use worker_runtime_core::{DispatchContext, EntryPoint, Request, Response, Runtime};
use worker_runtime_server::{ServerConfig, TestHandle, WorkerServer};

const TOKEN: &str = "test-token";

/// Counts teardowns so tests can observe the pool being stopped.
struct Counter {
    teardowns: Arc<AtomicUsize>,
}

impl EntryPoint for Counter {
    type App = String;

    fn dispatch(
        &self,
        app: &String,
        ctx: &DispatchContext,
        _request: Request,
    ) -> Result<Response, BoxError> {
        Ok(Response::text(
            200,
            &format!("{app} #{} on {}", ctx.request_number(), ctx.slot()),
        ))
    }

    fn teardown(&self, _app: &String, _slot: usize) -> Result<(), BoxError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn start_server(workers: usize) -> (TestHandle<Counter>, Arc<AtomicUsize>) {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let mut config = RuntimeConfig::default();
    config.cache.enabled = false;
    config.preload.enabled = false;

    let entry = Counter {
        teardowns: Arc::clone(&teardowns),
    };
    let runtime = Arc::new(Runtime::new(config, entry, || Ok("site".to_string())).unwrap());
    runtime.start(workers, 1000).await.unwrap();

    let server_config = ServerConfig::default().with_admin("/admin", TOKEN);
    let handle = WorkerServer::new(runtime, server_config)
        .start_test()
        .await
        .unwrap();

    (handle, teardowns)
}

#[tokio::test]
async fn test_requests_reach_workers() {
    let (server, _) = start_server(2).await;
    let client = reqwest::Client::new();

    let first = client
        .get(format!("{}/anything", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert!(first.text().await.unwrap().starts_with("site #1"));

    let ready = client
        .get(format!("{}/ready", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_pool() {
    let (server, teardowns) = start_server(3).await;
    let runtime = Arc::clone(server.state().runtime());

    server.shutdown().await;

    assert_eq!(runtime.status(), PoolStatus::Stopped);
    assert_eq!(teardowns.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_admin_stop_exits_server() {
    let (server, teardowns) = start_server(2).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/admin/stop", server.url()))
        .header("X-Admin-Token", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["stopped"], 2);
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);

    tokio::time::timeout(Duration::from_secs(5), server.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_admin_rejects_wrong_token() {
    let (server, _) = start_server(1).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/admin/reload", server.url()))
        .header("X-Admin-Token", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    server.shutdown().await;
}
