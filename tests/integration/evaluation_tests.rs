//! End-to-end evaluation through both execution paths

use assert_matches::assert_matches;
use evalkit_sandbox::{
    CompiledDocument, ConsoleLevel, EvaluateOptions, Evaluator, ExecutionPath, SecurityPolicy,
    SourceUnit, ThreadIsolatePlatform,
};
use evalkit_tests::{setup_test_logging, CountingPlatform};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One evaluator per execution path
fn evaluators() -> Vec<Evaluator> {
    vec![
        Evaluator::local(),
        Evaluator::with_platform(ThreadIsolatePlatform::new()),
    ]
}

#[tokio::test]
async fn test_return_value() {
    setup_test_logging();
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_script("return 1+1", EvaluateOptions::new())
            .await
            .unwrap();
        assert!(result.success, "{:?}", evaluator.dispatch_decision());
        assert_eq!(result.result, Some(json!(2)));
        assert!(result.error.is_none());
    }
}

#[tokio::test]
async fn test_thrown_error() {
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_script(
                "console.log('before'); throw new Error('x')",
                EvaluateOptions::new(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.result, None);
        let error = result.error.unwrap();
        assert!(error.message.contains('x'));
        assert_eq!(result.console_output.len(), 1);
        assert_eq!(result.console_output[0].text, "before");
    }
}

#[tokio::test]
async fn test_console_order_preserved() {
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_script(
                "console.log('one'); console.warn('two'); console.error('three'); return null;",
                EvaluateOptions::new(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!(null)));
        let entries: Vec<_> = result
            .console_output
            .iter()
            .map(|e| (e.level, e.text.as_str()))
            .collect();
        assert_eq!(
            entries,
            [
                (ConsoleLevel::Log, "one"),
                (ConsoleLevel::Warn, "two"),
                (ConsoleLevel::Error, "three"),
            ]
        );
    }
}

#[tokio::test]
async fn test_timeout_honored() {
    for evaluator in evaluators() {
        // The budget stops the spinning thread once the caller has given up
        let options = EvaluateOptions::new()
            .with_timeout_ms(50)
            .with_security(SecurityPolicy::default().with_cpu_budget_ms(2_000));
        let started = Instant::now();
        let result = evaluator
            .evaluate_script("while (true) {}", options)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!result.success);
        assert!(result.timed_out());
        assert_eq!(
            result.error.unwrap().message,
            "Execution timed out after 50ms"
        );
    }
}

#[tokio::test]
async fn test_top_level_await() {
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_script(
                "const v = await Promise.resolve(20); return v + 1;",
                EvaluateOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!(21)));
    }
}

#[tokio::test]
async fn test_typed_script() {
    let source = r#"
        interface Point { x: number; y: number }
        function norm1(p: Point): number {
            return Math.abs(p.x) + Math.abs(p.y);
        }
        const p = { x: -2, y: 3 } as Point;
        return norm1(p);
    "#;
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_typed_script(source, EvaluateOptions::new())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(5)));
    }
}

#[tokio::test]
async fn test_typed_script_enum() {
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_typed_script("enum Color { Red, Green }\nreturn Color.Green;", EvaluateOptions::new())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(1)));
    }
}

#[tokio::test]
async fn test_typed_script_parameter_property() {
    let source = "class P { constructor(private n: number) {} get(): number { return this.n; } }\nreturn new P(4).get();";
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_typed_script(source, EvaluateOptions::new())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(4)));
    }
}

#[tokio::test]
async fn test_typed_script_syntax_error_is_a_failed_result() {
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_typed_script("let x: = ;", EvaluateOptions::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.result, None);
        assert!(result.error.unwrap().message.contains("TypeScript parse error"));
    }
}

#[tokio::test]
async fn test_document_expressions() {
    let document = CompiledDocument::new("const items = [1, 2, 3];")
        .with_expression("items.length")
        .with_expression("items.reduce((a, b) => a + b, 0)");
    for evaluator in evaluators() {
        let result = evaluator
            .evaluate_document(&document, EvaluateOptions::new())
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!([3, 6])));
    }
}

#[tokio::test]
async fn test_undefined_result_is_absent() {
    let result = Evaluator::local()
        .evaluate_script("const a = 1;", EvaluateOptions::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_matches!(result.result, None);
}

#[tokio::test]
async fn test_ephemeral_isolates_are_not_kept() {
    let platform = CountingPlatform::new();
    let evaluator = Evaluator::builder().shared_platform(platform.clone()).build();
    assert_eq!(evaluator.dispatch_decision().path, ExecutionPath::Isolate);

    for _ in 0..3 {
        let result = evaluator
            .evaluate(&SourceUnit::script("return 'x';"), EvaluateOptions::new())
            .await
            .unwrap();
        assert!(result.success);
    }
    assert_eq!(platform.created(), 3);
    assert!(evaluator.registry().is_empty().await);
}

#[tokio::test]
async fn test_worker_id_reuses_isolate() {
    let platform = CountingPlatform::new();
    let evaluator = Evaluator::builder().shared_platform(platform.clone()).build();

    for _ in 0..3 {
        let result = evaluator
            .evaluate_script("return 'warm';", EvaluateOptions::new().with_worker_id("w"))
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!("warm")));
    }
    assert_eq!(platform.created(), 1);
    assert!(evaluator.registry().contains("w").await);
}

#[tokio::test]
async fn test_source_id_does_not_reach_worker() {
    let platform = CountingPlatform::new();
    let evaluator = Evaluator::builder().shared_platform(platform.clone()).build();

    let warm = evaluator
        .evaluate_script("return 'worker code';", EvaluateOptions::new().with_worker_id("w"))
        .await
        .unwrap();
    assert_eq!(warm.result, Some(json!("worker code")));

    let unit = SourceUnit::script("return 'new snippet';").with_id("w");
    let result = evaluator.evaluate(&unit, EvaluateOptions::new()).await.unwrap();
    assert_eq!(result.result, Some(json!("new snippet")));
    assert!(evaluator.registry().contains("w").await);
    assert_eq!(evaluator.registry().len().await, 1);
    assert_eq!(platform.created(), 2);
}

#[tokio::test]
async fn test_concurrent_units_with_one_id() {
    let evaluator = Evaluator::with_platform(ThreadIsolatePlatform::new());
    let options = || {
        EvaluateOptions::new().with_security(SecurityPolicy::default().with_cpu_budget_ms(5_000))
    };
    let slow = SourceUnit::script(
        "let s = 0; for (let i = 0; i < 200000; i++) { s += i; } return 'A';",
    )
    .with_id("same");
    let fast = SourceUnit::script("return 'B';").with_id("same");

    let (a, b) = tokio::join!(
        evaluator.evaluate(&slow, options()),
        evaluator.evaluate(&fast, options())
    );
    assert_eq!(a.unwrap().result, Some(json!("A")));
    assert_eq!(b.unwrap().result, Some(json!("B")));
    assert!(evaluator.registry().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fallback_console_isolation() {
    let evaluator = Arc::new(Evaluator::local());
    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let evaluator = evaluator.clone();
            let tag = format!("task{}", n);
            let unit = SourceUnit::script(format!(
                "for (let i = 0; i < 25; i++) {{ console.log('{}:' + i); await null; }} return '{}';",
                tag, tag
            ));
            tokio::spawn(async move {
                let result = evaluator.evaluate(&unit, EvaluateOptions::new()).await;
                (tag, result)
            })
        })
        .collect();

    for task in tasks {
        let (tag, result) = task.await.unwrap();
        let result = result.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(tag.clone())));
        let lines: Vec<&str> = result.console_output.iter().map(|e| e.text.as_str()).collect();
        let expected: Vec<String> = (0..25).map(|i| format!("{}:{}", tag, i)).collect();
        assert_eq!(lines, expected);
    }
}

#[tokio::test]
async fn test_duration_is_reported() {
    let result = Evaluator::local()
        .evaluate_script(
            "await new Promise(r => r()); return 1;",
            EvaluateOptions::new(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.duration_ms < 30_000);
}
