//! Isolate registry lifecycle against the thread platform

use assert_matches::assert_matches;
use evalkit_sandbox::{
    Invocation, InvocationReply, IsolateConfig, IsolateRegistry, IsolateRequest, SandboxError,
};
use evalkit_tests::CountingPlatform;
use serde_json::json;
use std::sync::Arc;

const COUNTER: &str = r#"({
    count: 0,
    increment(by) { this.count += by; return this.count; },
    async fetch(request, env) {
        return new Response(JSON.stringify({ url: request.url, method: request.method }));
    }
})"#;

fn counter_config() -> IsolateConfig {
    IsolateConfig::new("counter.js", COUNTER)
}

#[tokio::test]
async fn test_two_loads_create_one_isolate() {
    let platform = CountingPlatform::new();
    let registry = IsolateRegistry::new(Some(platform.clone()));

    let first = registry.load("counter", counter_config()).await.unwrap();
    let second = registry
        .load("counter", IsolateConfig::new("other.js", "({})"))
        .await
        .unwrap();

    assert!(first.same_isolate(&second));
    assert_eq!(platform.created(), 1);

    // The cached isolate keeps its original config and state
    first
        .invoke(Invocation::method("increment", vec![json!(2)]))
        .await
        .unwrap();
    let reply = second
        .invoke(Invocation::method("increment", vec![json!(3)]))
        .await
        .unwrap();
    assert_eq!(reply, InvocationReply::Value(json!(5)));
}

#[tokio::test]
async fn test_unload_invalidates() {
    let registry = IsolateRegistry::new(Some(CountingPlatform::new()));
    registry.load("counter", counter_config()).await.unwrap();

    let reply = registry
        .execute("counter", Invocation::method("increment", vec![json!(1)]))
        .await
        .unwrap();
    assert_eq!(reply, InvocationReply::Value(json!(1)));

    assert!(registry.unload("counter").await);
    let err = registry
        .execute("counter", Invocation::method("increment", vec![json!(1)]))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::NotLoaded(id) if id == "counter");
    assert!(!registry.unload("counter").await);
}

#[tokio::test]
async fn test_execute_unknown_id() {
    let registry = IsolateRegistry::new(Some(CountingPlatform::new()));
    let err = registry
        .execute("missing", Invocation::Request(IsolateRequest::get("https://x.test/")))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::NotLoaded(_));
}

#[tokio::test]
async fn test_request_invocation() {
    let registry = IsolateRegistry::new(Some(CountingPlatform::new()));
    registry.load("counter", counter_config()).await.unwrap();
    let reply = registry
        .execute(
            "counter",
            Invocation::Request(IsolateRequest::get("https://x.test/hello")),
        )
        .await
        .unwrap();
    let response = assert_matches!(reply, InvocationReply::Response(r) => r);
    assert!(response.is_success());
    assert_eq!(
        response.json().unwrap(),
        json!({ "url": "https://x.test/hello", "method": "GET" })
    );
}

#[tokio::test]
async fn test_no_platform() {
    let registry = IsolateRegistry::new(None);
    assert!(!registry.has_platform());
    let err = registry.load("counter", counter_config()).await.unwrap_err();
    assert_matches!(err, SandboxError::IsolationUnavailable);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_concurrent_loads_share_isolate() {
    let platform = CountingPlatform::new();
    let registry = Arc::new(IsolateRegistry::new(Some(platform.clone())));

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.load("shared", counter_config()).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(platform.created(), 1);

    assert_eq!(registry.unload_all().await, 1);
    assert!(registry.is_empty().await);
}

#[test]
fn test_entries_from_sync_code() {
    let registry = IsolateRegistry::new(Some(CountingPlatform::new()));
    tokio_test::block_on(async {
        registry.load("a", counter_config()).await.unwrap();
        registry.load("b", counter_config()).await.unwrap();
        let ids: Vec<String> = registry.entries().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
        registry.unload_all().await;
    });
}
