//! HTTP-level tests for the gateway routes
//!
//! Requests go straight into the axum router with `tower::ServiceExt::oneshot`;
//! the management host is the scripted in-memory fake.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use scvmm_gateway::api::{create_router, ApiState};
use scvmm_gateway::command::{CommandKind, Dispatcher, DispatcherConfig, TemplateStore};
use scvmm_gateway::session::{CommandResult, SessionPool};

use common::{bag, eventually, pool_config, start_pool, templates, FakeHost, Reply, VM_ID};

struct Gateway {
    app: Router,
    pool: Arc<SessionPool>,
}

async fn gateway(host: &Arc<FakeHost>, store: TemplateStore) -> Gateway {
    let pool = start_pool(host, pool_config(1, 1)).await;
    let config = DispatcherConfig {
        request_timeout: Duration::from_millis(200),
        operation_timeout: Duration::from_secs(1),
    };
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pool), store, config));
    Gateway {
        app: create_router(ApiState { dispatcher }),
        pool,
    }
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// The root redirects to the pool status page
#[tokio::test]
async fn test_root_redirects_to_pool_status() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let response = gw
        .app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/api/pool/status"
    );
}

/// Listing normalizes the owner and returns the VM wire records
#[tokio::test]
async fn test_list_normalizes_owner() {
    let host = FakeHost::new();
    host.push_reply(Reply::Ok(CommandResult::with_records(vec![bag(&[
        ("Name", "build-01"),
        ("VMId", VM_ID),
    ])])));
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, body) = send(&gw.app, "GET", "/api/vm/list?domain=corp&username=Alice").await;

    assert_eq!(status, StatusCode::OK);
    let vms: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(vms[0]["Name"], "build-01");
    assert_eq!(vms[0]["ID"], VM_ID);
    assert_eq!(vms[0]["VMHost"], "-");
    assert_eq!(host.calls()[0].1, ["CORP", "alice"]);
}

/// Missing query parameters are rejected by the extractor
#[tokio::test]
async fn test_list_requires_owner() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, _) = send(&gw.app, "GET", "/api/vm/list?domain=corp").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(host.calls().is_empty());
}

/// VM actions answer 204 and run in the background
#[tokio::test]
async fn test_vm_actions_return_no_content() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    for action in ["start", "save", "shutdown", "poweroff"] {
        let uri = format!("/api/vm/{action}?vmid={VM_ID}");
        let (status, body) = send(&gw.app, "POST", &uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{action}");
        assert!(body.is_empty());
        assert!(eventually(|| gw.pool.stats().idle == 1).await);
    }
    assert_eq!(host.calls().len(), 4);
}

/// A malformed VM identifier is a 422
#[tokio::test]
async fn test_invalid_vmid_is_unprocessable() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, body) = send(&gw.app, "POST", "/api/vm/start?vmid=web-01").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body.contains("web-01"));
    assert!(host.calls().is_empty());
}

/// VM actions are POST only
#[tokio::test]
async fn test_vm_action_rejects_get() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, _) = send(&gw.app, "GET", &format!("/api/vm/start?vmid={VM_ID}")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

/// A command whose script did not load is a 500 with a fixed message
#[tokio::test]
async fn test_missing_script_message() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&[CommandKind::List])).await;

    let (status, body) = send(&gw.app, "POST", &format!("/api/vm/save?vmid={VM_ID}")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Server error: script not found.");
}

/// No session within the request timeout is a 503
#[tokio::test]
async fn test_busy_pool_is_503() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;
    let _held = gw.pool.acquire(Duration::from_secs(1)).await.unwrap();

    let (status, body) = send(&gw.app, "GET", "/api/vm/list?domain=corp&username=alice").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "No SCVMM session available.");
}

/// A host that does not answer in time is a 504
#[tokio::test]
async fn test_slow_host_is_504() {
    let host = FakeHost::new();
    host.push_reply(Reply::Delayed(Duration::from_millis(600), CommandResult::default()));
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, body) = send(&gw.app, "GET", "/api/vm/list?domain=corp&username=alice").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body, "SCVMM is not available now.");
}

/// Host-side errors with no output are a 500
#[tokio::test]
async fn test_host_error_is_500() {
    let host = FakeHost::new();
    host.push_reply(Reply::Fault("Get-SCVirtualMachine: access denied".to_string()));
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, body) = send(&gw.app, "GET", "/api/vm/list?domain=corp&username=alice").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "SCVMM-API internal error occured.");
}

/// Pool status reports the live counters as JSON
#[tokio::test]
async fn test_pool_status() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;

    let (status, body) = send(&gw.app, "GET", "/api/pool/status").await;
    assert_eq!(status, StatusCode::OK);

    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["live"], 1);
    assert_eq!(stats["idle"], 1);
    assert_eq!(stats["borrowed"], 0);
    assert_eq!(stats["max_sessions"], 1);
    assert_eq!(stats["closed"], false);
}

/// Prometheus text is served on /metrics
#[tokio::test]
async fn test_metrics_endpoint() {
    let host = FakeHost::new();
    let gw = gateway(&host, templates(&CommandKind::ALL)).await;
    let _ = send(&gw.app, "GET", "/api/vm/list?domain=corp&username=alice").await;

    let (status, body) = send(&gw.app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("scvmm_pool_live_sessions"));
    assert!(body.contains("scvmm_dispatch_total"));
}
