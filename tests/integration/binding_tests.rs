//! Capability bindings, db handles and network posture

use assert_matches::assert_matches;
use evalkit_sandbox::{
    BindingSet, DbContext, EvaluateOptions, Evaluator, MemoryDb, NetworkPosture, SandboxError,
    SecurityPolicy, ThreadIsolatePlatform,
};
use evalkit_tests::RecordingFetcher;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing_test::traced_test;

fn evaluators_with(fetcher: Arc<RecordingFetcher>) -> Vec<Evaluator> {
    vec![
        Evaluator::builder().shared_fetcher(fetcher.clone()).build(),
        Evaluator::builder()
            .platform(ThreadIsolatePlatform::new())
            .shared_fetcher(fetcher)
            .build(),
    ]
}

fn evaluators() -> Vec<Evaluator> {
    evaluators_with(RecordingFetcher::new(""))
}

fn seeded_db() -> Arc<MemoryDb> {
    Arc::new(
        MemoryDb::from_json(json!({
            "user:1": { "name": "Ada", "langs": ["en", "fr"] },
            "user:2": { "name": "Lin", "langs": [] },
            "note:1": { "body": "hi" },
        }))
        .unwrap(),
    )
}

#[tokio::test]
#[traced_test]
async fn test_binding_visibility() {
    let bindings = BindingSet::new()
        .data("greeting", json!("hello"))
        .unwrap()
        .data("secret", json!("s3cret"))
        .unwrap()
        .function("double", |args: Vec<Value>| {
            let n = args.first().and_then(Value::as_f64).ok_or("expected a number")?;
            Ok(json!(n * 2.0))
        })
        .unwrap();
    let policy = SecurityPolicy::default().with_bindings_allow_list(["greeting", "double"]);

    for evaluator in evaluators() {
        let options = EvaluateOptions::new()
            .with_bindings(bindings.clone())
            .with_security(policy.clone());
        let result = evaluator
            .evaluate_script(
                "return { greeting, doubled: await double(21), secret: typeof secret };",
                options,
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({ "greeting": "hello", "doubled": 42, "secret": "undefined" }))
        );
    }
    assert!(logs_contain("secret"));
}

#[tokio::test]
async fn test_host_function_error_is_thrown() {
    let bindings = BindingSet::new()
        .function("fail", |_args: Vec<Value>| Err("nope".to_string()))
        .unwrap();
    for evaluator in evaluators() {
        let options = EvaluateOptions::new().with_bindings(bindings.clone());
        let result = evaluator
            .evaluate_script(
                "try { await fail(); } catch (e) { return 'caught ' + e.message; }",
                options,
            )
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!("caught nope")));
    }
}

#[tokio::test]
async fn test_db_round_trip_read_write() {
    for evaluator in evaluators() {
        let db = seeded_db();
        let options = EvaluateOptions::new().with_db(db.clone());
        let result = evaluator
            .evaluate_script(
                r#"
                const users = await db.list('user:*');
                const first = await db.get(users[0].id);
                await db.set('note:2', { body: 'new' });
                const removed = await db.delete('note:1');
                return { ids: users.map(u => u.id), same: JSON.stringify(first) === JSON.stringify(users[0].data), removed };
                "#,
                options,
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({ "ids": ["user:1", "user:2"], "same": true, "removed": 1 }))
        );
        assert_eq!(db.get("note:2").unwrap(), Some(json!({ "body": "new" })));
        assert_eq!(db.get("note:1").unwrap(), None);
    }
}

#[tokio::test]
async fn test_db_round_trip_read_only() {
    for evaluator in evaluators() {
        let db: Arc<dyn DbContext> = Arc::new(seeded_db().read_only());
        let options = EvaluateOptions::new().with_db(db);
        let result = evaluator
            .evaluate_script(
                r#"
                const users = await db.list('user:*');
                const first = await db.get(users[0].id);
                return {
                    name: first.name,
                    same: JSON.stringify(first) === JSON.stringify(users[0].data),
                    mutable: typeof db.set === 'function' || typeof db.delete === 'function',
                };
                "#,
                options,
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({ "name": "Ada", "same": true, "mutable": false }))
        );
    }
}

#[tokio::test]
async fn test_db_name_collision() {
    let bindings = BindingSet::new().data("db", json!({})).unwrap();
    let options = EvaluateOptions::new()
        .with_bindings(bindings)
        .with_db(seeded_db());
    let err = Evaluator::local()
        .evaluate_script("return 1;", options)
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::ReservedBinding(name) if name == "db");
}

#[test]
fn test_reserved_binding_names() {
    assert_matches!(
        BindingSet::new().data("console", json!(1)),
        Err(SandboxError::ReservedBinding(_))
    );
    assert_matches!(
        BindingSet::new().data("not valid", json!(1)),
        Err(SandboxError::InvalidBindingName(_))
    );
}

#[tokio::test]
async fn test_blocked_network() {
    let fetcher = RecordingFetcher::new("unused");
    for evaluator in evaluators_with(fetcher.clone()) {
        let options = EvaluateOptions::new()
            .with_security(SecurityPolicy::default().with_network(NetworkPosture::Blocked));
        let result = evaluator
            .evaluate_script("await fetch('https://example.com/');", options)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("blocked"));
    }
    assert!(fetcher.seen().is_empty());
}

#[tokio::test]
async fn test_allow_listed_network() {
    let fetcher = RecordingFetcher::new(r#"{"ok":true}"#);
    let policy = SecurityPolicy::default()
        .with_network(NetworkPosture::AllowListed(vec!["example.com".to_string()]));
    for evaluator in evaluators_with(fetcher.clone()) {
        let options = EvaluateOptions::new().with_security(policy.clone());
        let result = evaluator
            .evaluate_script(
                r#"
                const allowed = await (await fetch('https://api.example.com/v1')).json();
                let denied = null;
                try { await fetch('https://other.org/'); } catch (e) { denied = e.message; }
                return { allowed, denied };
                "#,
                options,
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        let value = result.result.unwrap();
        assert_eq!(value["allowed"], json!({ "ok": true }));
        assert!(value["denied"].as_str().unwrap().contains("not allowed"));
    }
    assert_eq!(
        fetcher.seen(),
        ["https://api.example.com/v1", "https://api.example.com/v1"]
    );
}
