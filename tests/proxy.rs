//! Reverse proxy against a loopback upstream

mod common;

use common::{FixedClock, Harness};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use std::sync::Arc;
use tenantgate::config::ProxyConfig;
use tenantgate::instance::{Instance, InstanceStatus};
use tenantgate::pool::{ConnectionPool, PoolConfig};
use tenantgate::proxy::InstanceProxy;

struct ProxyFixture {
    harness: Harness,
    proxy: InstanceProxy,
    clock: Arc<FixedClock>,
}

async fn fixture() -> ProxyFixture {
    let harness = Harness::new().await;
    let clock = FixedClock::at_noon();
    let config = ProxyConfig {
        request_timeout_secs: 1,
        upstream_host: "127.0.0.1".to_string(),
        ..Default::default()
    };
    let proxy = InstanceProxy::new(
        harness.registry.clone(),
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        clock.clone(),
        &config,
    );

    ProxyFixture {
        harness,
        proxy,
        clock,
    }
}

impl ProxyFixture {
    async fn running_instance(&self) -> Instance {
        let port = common::spawn_upstream().await;
        self.harness
            .seed("live", Some("abc"), Some(port), InstanceStatus::Running)
    }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_string(response: hyper::Response<http_body_util::combinators::BoxBody<Bytes, hyper::Error>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_forwards_messages_request_and_records_activity() {
    let f = fixture().await;
    let instance = f.running_instance().await;
    assert!(instance.last_activity.is_none());

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/messages?limit=10", instance.id)))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "mock");
    assert_eq!(body_string(response).await, r#"{"messages":[]}"#);
    assert_eq!(f.harness.reload(&instance.id).last_activity, Some(f.clock.0));
}

#[tokio::test]
async fn test_query_string_forwarded_verbatim() {
    let f = fixture().await;
    let instance = f.running_instance().await;

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/app/login?q=a%20b&x=1&x=2", instance.id)))
        .await;

    let echoed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(echoed["path"], "/app/login");
    assert_eq!(echoed["query"], "q=a%20b&x=1&x=2");
}

#[tokio::test]
async fn test_method_and_body_forwarded() {
    let f = fixture().await;
    let instance = f.running_instance().await;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/instance/{}/send/message", instance.id))
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(r#"{"phone":"6281","message":"hi"}"#)))
        .unwrap();

    let response = f.proxy.handle(req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let echoed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/send/message");
    assert_eq!(echoed["body"], r#"{"phone":"6281","message":"hi"}"#);
}

#[tokio::test]
async fn test_only_allow_listed_headers_forwarded() {
    let f = fixture().await;
    let instance = f.running_instance().await;

    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("/instance/{}/headers", instance.id))
        .header("Content-Type", "application/json")
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .header("Accept", "application/json")
        .header("User-Agent", "tenant-client/1.0")
        .header("Cookie", "session=secret")
        .header("X-Custom", "drop-me")
        .header("X-Forwarded-For", "10.1.1.1")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = f.proxy.handle(req).await;
    let received: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();

    assert_eq!(received["content-type"], "application/json");
    assert_eq!(received["authorization"], "Basic dXNlcjpwYXNz");
    assert_eq!(received["accept"], "application/json");
    assert_eq!(received["user-agent"], "tenant-client/1.0");
    assert!(received.get("cookie").is_none());
    assert!(received.get("x-custom").is_none());
    assert!(received.get("x-forwarded-for").is_none());
}

/// Upstream that sends headers and part of the body, then goes silent
async fn spawn_stalling_upstream() -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n{\"partial")
                    .await;
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_stalled_upstream_body_times_out() {
    let f = fixture().await;
    let port = spawn_stalling_upstream().await;
    let instance = f
        .harness
        .seed("stall", Some("abc"), Some(port), InstanceStatus::Running);

    let response = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        f.proxy.handle(get(&format!("/instance/{}/messages", instance.id))),
    )
    .await
    .expect("proxy must give up within its own timeout");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers().get("x-proxy-error").unwrap(), "PROXY_FAILURE");
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(body["message"].as_str().unwrap().contains("timed out"));
    assert_eq!(f.harness.reload(&instance.id).last_activity, None);
}

#[tokio::test]
async fn test_every_non_running_status_rejected() {
    let f = fixture().await;

    let cases = [
        ("errored", true, InstanceStatus::Error),
        ("booting", true, InstanceStatus::Creating),
        ("no-daemon", true, InstanceStatus::DockerUnavailable),
        ("portless", false, InstanceStatus::Running),
    ];

    for (name, with_port, status) in cases {
        let port = if with_port {
            Some(common::spawn_upstream().await)
        } else {
            None
        };
        let instance = f.harness.seed(name, Some(name), port, status);
        let response = f
            .proxy
            .handle(get(&format!("/instance/{}/messages", instance.id)))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", name);
        assert_eq!(response.headers().get("x-proxy-error").unwrap(), "NOT_RUNNING");
        assert_eq!(f.harness.reload(&instance.id).last_activity, None);
    }
}

#[tokio::test]
async fn test_not_running_instance_rejected() {
    let f = fixture().await;
    let port = common::spawn_upstream().await;
    let instance = f
        .harness
        .seed("idle", Some("abc"), Some(port), InstanceStatus::Stopped);

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/messages", instance.id)))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("x-proxy-error").unwrap(), "NOT_RUNNING");
    assert_eq!(body_string(response).await, r#"{"error":"Instance is not running"}"#);
    assert_eq!(f.harness.reload(&instance.id).last_activity, None);
}

#[tokio::test]
async fn test_unknown_instance_and_invalid_path() {
    let f = fixture().await;

    let response = f.proxy.handle(get("/instance/does-not-exist/messages")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, r#"{"error":"Instance not found"}"#);

    let response = f.proxy.handle(get("/instance/only-id")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, r#"{"error":"Invalid API path"}"#);
}

#[tokio::test]
async fn test_upstream_error_status_relayed() {
    let f = fixture().await;
    let instance = f.running_instance().await;

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/error", instance.id)))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get("x-proxy-error").is_none());
    assert_eq!(body_string(response).await, "backend exploded");
    assert_eq!(f.harness.reload(&instance.id).last_activity, Some(f.clock.0));
}

#[tokio::test]
async fn test_upstream_timeout_is_proxy_failure() {
    let f = fixture().await;
    let instance = f.running_instance().await;

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/slow", instance.id)))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers().get("x-proxy-error").unwrap(), "PROXY_FAILURE");
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "Proxy request failed");
    assert!(body["message"].as_str().unwrap().contains("timed out"));
    assert_eq!(f.harness.reload(&instance.id).last_activity, None);
}

#[tokio::test]
async fn test_connection_refused_is_proxy_failure() {
    let f = fixture().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let instance = f
        .harness
        .seed("dead", Some("abc"), Some(port), InstanceStatus::Running);

    let response = f
        .proxy
        .handle(get(&format!("/instance/{}/messages", instance.id)))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "Proxy request failed");
    assert!(body.get("message").is_some());
    assert_eq!(f.harness.reload(&instance.id).last_activity, None);
}
