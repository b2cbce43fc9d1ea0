//! Dynamic fan-out: runtime expansion, nesting, empty sources, and the
//! barrier view exposed by `describe`.

use serde_json::{json, Value};
use weft::{fan_out, flow, task, ArgNode, FailurePolicy, Params, RunOptions, Task, WeftError};

fn square() -> Task {
    task("square")
        .body_async(|args| async move {
            let x = args[0].as_i64().unwrap_or(0);
            Ok(json!(x * x))
        })
        .build()
        .unwrap()
}

fn increment() -> Task {
    task("increment")
        .body_async(|args| async move {
            let x = args[0].as_i64().unwrap_or(0);
            Ok(json!(x + 1))
        })
        .build()
        .unwrap()
}

fn collect() -> Task {
    task("collect")
        .body_async(|args| async move { Ok(args[0].clone()) })
        .build()
        .unwrap()
}

fn source_of(values: Value) -> Task {
    task("source")
        .body_async(move |_| {
            let values = values.clone();
            async move { Ok(values) }
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn expansion_maps_each_element_in_order() {
    let f = flow("expand", |cx, _params| {
        let nums = source_of(json!([1, 2, 3])).call(cx, vec![]);
        fan_out(cx, &square(), nums, None)
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!([1, 4, 9]));
}

#[tokio::test]
async fn empty_source_expands_to_zero_children() {
    let f = flow("empty_expand", |cx, _params| {
        let nums = source_of(json!([])).call(cx, vec![]);
        let mapped = fan_out(cx, &square(), nums, None);
        collect().call(cx, vec![mapped])
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!([]));
}

#[tokio::test]
async fn nested_fan_out_chains_through_both_levels() {
    let f = flow("nested", |cx, _params| {
        let nums = source_of(json!([1, 2, 3])).call(cx, vec![]);
        let squared = fan_out(cx, &square(), nums, None);
        let bumped = fan_out(cx, &increment(), squared, None);
        collect().call(cx, vec![bumped])
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!([2, 5, 10]));
}

#[tokio::test]
async fn nested_fan_out_over_empty_source_collapses() {
    let f = flow("nested_empty", |cx, _params| {
        let nums = source_of(json!([])).call(cx, vec![]);
        let squared = fan_out(cx, &square(), nums, None);
        let bumped = fan_out(cx, &increment(), squared, None);
        collect().call(cx, vec![bumped])
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!([]));
}

#[tokio::test]
async fn non_array_source_fails_the_run() {
    let f = flow("bad_source", |cx, _params| {
        let scalar = source_of(json!(42)).call(cx, vec![]);
        fan_out(cx, &square(), scalar, None)
    });
    let err = f.run(Params::new(), RunOptions::default()).await.unwrap_err();
    match err {
        WeftError::Task(e) => {
            assert_eq!(e.task, "dynamic");
            assert!(e.cause.contains("array"));
        }
        other => panic!("expected dynamic fan_out error, got {:?}", other),
    }
}

#[tokio::test]
async fn static_fan_out_expands_at_build_time() {
    let f = flow("static_expand", |cx, _params| {
        let mapped = fan_out(cx, &square(), ArgNode::value(json!([2, 3])), None);
        collect().call(cx, vec![mapped])
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!([4, 9]));
}

#[tokio::test]
async fn consumer_with_other_dependencies_waits_for_children() {
    let f = flow("mixed_deps", |cx, _params| {
        let nums = source_of(json!([10, 20])).call(cx, vec![]);
        let mapped = fan_out(cx, &square(), nums, None);
        let offset = increment().call(cx, vec![ArgNode::from(0)]);
        let join = task("join")
            .body_async(|args| async move {
                let xs = args[0].as_array().cloned().unwrap_or_default();
                let offset = args[1].as_i64().unwrap_or(0);
                let total: i64 = xs.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total + offset))
            })
            .build()
            .unwrap();
        join.call(cx, vec![mapped, offset])
    });
    let out = f.run(Params::new(), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!(501));
}

#[tokio::test]
async fn fan_out_under_continue_policy_with_healthy_source() {
    let f = flow("continue_fanout", |cx, _params| {
        let nums = source_of(json!([5])).call(cx, vec![]);
        fan_out(cx, &square(), nums, None)
    });
    let out = f
        .run(
            Params::new(),
            RunOptions {
                failure_policy: FailurePolicy::Continue,
                max_concurrency: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(out, json!([25]));
}

#[test]
fn describe_exposes_one_barrier_per_nesting_level() {
    let f = flow("depth_two", |cx, _params| {
        let nums = source_of(json!([1])).call(cx, vec![]);
        let squared = fan_out(cx, &square(), nums, None);
        let bumped = fan_out(cx, &increment(), squared, None);
        collect().call(cx, vec![bumped])
    });
    let desc = f.describe(&Params::new()).unwrap();
    assert_eq!(desc["dynamic_count"], 2);
    let barriers = desc["dynamic_fanouts"].as_array().unwrap();
    assert_eq!(barriers[0]["id"], "fanout:0");
    assert_eq!(barriers[0]["source"], "source:1");
    assert_eq!(barriers[1]["id"], "fanout:1");
    assert_eq!(barriers[1]["source"], "fanout:0");
    assert_eq!(barriers[1]["consumers"][0], "collect:1");

    // Only static nodes count as nodes; children appear at runtime.
    assert_eq!(desc["count"], 2);
}

#[test]
fn describe_is_pure_with_dynamic_fanouts() {
    let f = flow("pure_dynamic", |cx, _params| {
        let nums = source_of(json!([1, 2])).call(cx, vec![]);
        fan_out(cx, &square(), nums, None)
    });
    let a = f.describe(&Params::new()).unwrap();
    let b = f.describe(&Params::new()).unwrap();
    assert_eq!(a, b);
}
