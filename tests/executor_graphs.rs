// Dataflow executor behaviour: arithmetic, feeds, control flow, loops,
// variables, rendezvous.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use salus::core::{SchedulingParam, GIB, MIB};
use salus::device::PlatformConfig;
use salus::graph::{GraphDef, NodeDef};
use salus::session::{
    CloseSessionRequest, CreateSessionRequest, ExtendSessionRequest, Frontend, RunStepRequest,
    SalusOptions, SessionConfig, TensorData,
};
use salus::tensor::DataType;
use salus::{Runtime, RuntimeConfig};

fn node(name: &str, op: &str, inputs: &[&str], attrs: serde_json::Value) -> NodeDef {
    NodeDef {
        name: name.into(),
        op: op.into(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        attrs: attrs
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default(),
    }
}

fn test_runtime() -> Arc<Runtime> {
    Runtime::boot(RuntimeConfig {
        platform: PlatformConfig {
            gpu_count: 1,
            gpu_memory_cap: 4 * GIB,
            gpu_reported_memory: Some(5 * GIB),
            cpu_memory: Some(4 * GIB),
        },
        param: SchedulingParam::default(),
    })
}

fn small_resource_map() -> HashMap<String, f64> {
    let mut map = HashMap::new();
    map.insert("MEMORY:GPU0.persistent".to_string(), (64 * MIB) as f64);
    map.insert("MEMORY:GPU0.temporary".to_string(), (64 * MIB) as f64);
    map
}

async fn open_session(runtime: &Arc<Runtime>, graph: GraphDef) -> (String, Option<u64>) {
    let created = runtime
        .create_session(CreateSessionRequest {
            graph: Some(graph),
            config: SessionConfig {
                salus_options: SalusOptions {
                    resource_map: small_resource_map(),
                    is_inference: false,
                },
            },
        })
        .await
        .expect("session admitted");
    (created.session_handle, created.graph_id)
}

async fn run(
    runtime: &Arc<Runtime>,
    handle: &str,
    graph_id: Option<u64>,
    feeds: HashMap<String, TensorData>,
    fetches: &[&str],
) -> HashMap<String, TensorData> {
    runtime
        .run_step(RunStepRequest {
            session_handle: handle.to_string(),
            graph_id,
            partial_handle: None,
            feeds,
            fetches: fetches.iter().map(|s| s.to_string()).collect(),
            is_expensive: true,
        })
        .await
        .expect("step succeeds")
        .fetched
}

async fn close(runtime: &Arc<Runtime>, handle: String) {
    runtime
        .close_session(CloseSessionRequest { session_handle: handle })
        .await
        .expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_feed_add_fetch() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "add".into(),
        nodes: vec![
            node("x", "Placeholder", &[], json!({"dtype": "f32"})),
            node("y", "Const", &[], json!({"value": [10.0, 20.0, 30.0]})),
            node("sum", "Add", &["x", "y"], json!({})),
            node("scaled", "Mul", &["sum", "two"], json!({})),
            node("two", "Const", &[], json!({"value": 2.0, "shape": [1]})),
        ],
    };

    let (handle, gid) = open_session(&runtime, graph).await;
    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        TensorData { dtype: DataType::F32, shape: vec![3], f32s: vec![1.0, 2.0, 3.0], ..Default::default() },
    );
    let out = run(&runtime, &handle, gid, feeds, &["scaled"]).await;
    assert_eq!(out["scaled"].f32s, vec![22.0, 44.0, 66.0]);

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_feed_is_invalid_argument() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "nofeed".into(),
        nodes: vec![
            node("x", "Placeholder", &[], json!({"dtype": "f32"})),
            node("out", "Identity", &["x"], json!({})),
        ],
    };
    let (handle, gid) = open_session(&runtime, graph).await;

    let err = runtime
        .run_step(RunStepRequest {
            session_handle: handle.clone(),
            graph_id: gid,
            partial_handle: None,
            feeds: HashMap::new(),
            fetches: vec!["out".into()],
            is_expensive: true,
        })
        .await
        .expect_err("unfed placeholder must fail");
    assert_eq!(err.code, salus::core::Code::InvalidArgument);

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_merge_dead_propagation() {
    // pred selects one branch; the dead branch must not poison the merge.
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "cond".into(),
        nodes: vec![
            node("x", "Const", &[], json!({"value": 5.0, "shape": [1]})),
            node("pred", "Placeholder", &[], json!({"dtype": "bool"})),
            node("sw", "Switch", &["x", "pred"], json!({})),
            node("neg_branch", "Mul", &["sw:0", "minus"], json!({})),
            node("minus", "Const", &[], json!({"value": -1.0, "shape": [1]})),
            node("pos_branch", "Add", &["sw:1", "hundred"], json!({})),
            node("hundred", "Const", &[], json!({"value": 100.0, "shape": [1]})),
            node("merged", "Merge", &["neg_branch", "pos_branch"], json!({})),
        ],
    };

    let (handle, gid) = open_session(&runtime, graph).await;

    let mut feeds = HashMap::new();
    feeds.insert(
        "pred".to_string(),
        TensorData { dtype: DataType::Bool, shape: vec![1], bools: vec![true], ..Default::default() },
    );
    let out = run(&runtime, &handle, gid, feeds, &["merged"]).await;
    assert_eq!(out["merged"].f32s, vec![105.0], "true branch taken");

    let mut feeds = HashMap::new();
    feeds.insert(
        "pred".to_string(),
        TensorData { dtype: DataType::Bool, shape: vec![1], bools: vec![false], ..Default::default() },
    );
    let out = run(&runtime, &handle, gid, feeds, &["merged"]).await;
    assert_eq!(out["merged"].f32s, vec![-5.0], "false branch taken");

    close(&runtime, handle).await;
    runtime.shutdown();
}

/// A TF-style while loop: i = 0; while (i < 10) i += 1; fetch the exit.
/// Three parallel iterations are allowed; deferred next-iteration roots
/// exercise the window.
fn while_loop_graph() -> GraphDef {
    GraphDef {
        name: "while".into(),
        nodes: vec![
            node("zero", "Const", &[], json!({"value": 0.0, "shape": [1]})),
            node("ten", "Const", &[], json!({"value": 10.0, "shape": [1]})),
            node("one", "Const", &[], json!({"value": 1.0, "shape": [1]})),
            node("enter_i", "Enter", &["zero"], json!({"frame_name": "loop"})),
            node(
                "enter_limit",
                "Enter",
                &["ten"],
                json!({"frame_name": "loop", "is_constant": true}),
            ),
            node(
                "enter_one",
                "Enter",
                &["one"],
                json!({"frame_name": "loop", "is_constant": true}),
            ),
            node(
                "i",
                "Merge",
                &["enter_i", "next"],
                json!({"max_parallel_iterations": 3}),
            ),
            node("cond", "Less", &["i", "enter_limit"], json!({})),
            node("lc", "LoopCond", &["cond"], json!({"dtype": "bool"})),
            node("sw", "Switch", &["i", "lc"], json!({})),
            node("body", "Add", &["sw:1", "enter_one"], json!({})),
            node("next", "NextIteration", &["body"], json!({})),
            node("out", "Exit", &["sw:0"], json!({})),
        ],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_while_loop_counts_to_ten() {
    let runtime = test_runtime();
    let (handle, gid) = open_session(&runtime, while_loop_graph()).await;

    // Twice, to prove frame state resets cleanly between iterations.
    for _ in 0..2 {
        let out = run(&runtime, &handle, gid, HashMap::new(), &["out"]).await;
        assert_eq!(out["out"].f32s, vec![10.0]);
    }

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_variables_persist_across_steps_and_graphs() {
    let runtime = test_runtime();

    // Graph 1 increments the variable through its reference; the read-back
    // is ordered behind the write with control deps (one through a NoOp).
    let train = GraphDef {
        name: "train".into(),
        nodes: vec![
            node("w", "Variable", &[], json!({"dtype": "f32", "shape": [2]})),
            node("one", "Const", &[], json!({"value": 1.0, "shape": [1]})),
            node("bumped", "Add", &["w", "one"], json!({})),
            node("store", "Assign", &["w", "bumped"], json!({})),
            node("barrier", "NoOp", &["^store"], json!({})),
            node("after", "Identity", &["w", "^barrier"], json!({})),
        ],
    };
    let (handle, gid) = open_session(&runtime, train).await;

    for expect in [1.0f32, 2.0, 3.0] {
        let out = run(&runtime, &handle, gid, HashMap::new(), &["store", "after"]).await;
        assert_eq!(out["store"].f32s, vec![expect, expect]);
        assert_eq!(out["after"].f32s, vec![expect, expect], "read ordered after the write");
    }

    // Graph 2 reads the same variable by node name.
    let read = GraphDef {
        name: "read".into(),
        nodes: vec![
            node("w", "Variable", &[], json!({"dtype": "f32", "shape": [2]})),
            node("snapshot", "Identity", &["w"], json!({})),
        ],
    };
    let ext = runtime
        .extend_session(ExtendSessionRequest { session_handle: handle.clone(), graph: read })
        .await
        .expect("extend");
    let out = run(&runtime, &handle, Some(ext.graph_id), HashMap::new(), &["snapshot"]).await;
    assert_eq!(out["snapshot"].f32s, vec![3.0, 3.0]);

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_recv_through_rendezvous() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "pipe".into(),
        nodes: vec![
            node("payload", "Const", &[], json!({"value": [7.0, 8.0]})),
            node("tx", "Send", &["payload"], json!({"tensor_name": "edge"})),
            node("rx", "Recv", &[], json!({"tensor_name": "edge", "dtype": "f32"})),
            node("out", "Identity", &["rx"], json!({})),
        ],
    };
    let (handle, gid) = open_session(&runtime, graph).await;
    let out = run(&runtime, &handle, gid, HashMap::new(), &["out"]).await;
    assert_eq!(out["out"].f32s, vec![7.0, 8.0]);

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slice_produces_view_of_parent_buffer() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "slices".into(),
        nodes: vec![
            node("base", "Const", &[], json!({"value": [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]})),
            node("mid", "Slice", &["base"], json!({"begin": 2, "size": 3})),
        ],
    };
    let (handle, gid) = open_session(&runtime, graph).await;
    let out = run(&runtime, &handle, gid, HashMap::new(), &["mid"]).await;
    assert_eq!(out["mid"].f32s, vec![2.0, 3.0, 4.0]);
    assert_eq!(out["mid"].shape, vec![3]);

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graph_registration_deduplicates() {
    let runtime = test_runtime();
    let graph = while_loop_graph();
    let (handle, gid) = open_session(&runtime, graph.clone()).await;

    let again = runtime
        .extend_session(ExtendSessionRequest { session_handle: handle.clone(), graph })
        .await
        .expect("extend");
    assert_eq!(Some(again.graph_id), gid, "identical graph re-registration is a cache hit");

    close(&runtime, handle).await;
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_drain_before_close() {
    // Close waits for the in-flight step; the step's result still arrives.
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "slowish".into(),
        nodes: vec![
            node("a", "Const", &[], json!({"value": 3.0, "shape": [64]})),
            node("b", "Const", &[], json!({"value": 4.0, "shape": [64]})),
            node("m", "Mul", &["a", "b"], json!({})),
        ],
    };
    let (handle, gid) = open_session(&runtime, graph).await;

    let rt2 = runtime.clone();
    let h2 = handle.clone();
    let step = tokio::spawn(async move { run(&rt2, &h2, gid, HashMap::new(), &["m"]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    close(&runtime, handle).await;
    let out = step.await.expect("step task joins");
    assert_eq!(out["m"].f32s[0], 12.0);
    runtime.shutdown();
}
