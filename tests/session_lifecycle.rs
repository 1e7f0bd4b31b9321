// Session teardown paths: forced close mid-iteration, cancelled queue
// drains, rendezvous abort, partial runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use salus::core::{Code, SchedulingParam, GIB, MIB};
use salus::device::PlatformConfig;
use salus::graph::{GraphDef, NodeDef};
use salus::session::{
    CreateSessionRequest, Frontend, PartialRunSetupRequest, RunStepRequest, SalusOptions,
    SessionConfig,
};
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
            gpu_memory_cap: 2 * GIB,
            gpu_reported_memory: Some(3 * GIB),
            cpu_memory: Some(2 * GIB),
        },
        param: SchedulingParam::default(),
    })
}

fn small_session(graph: GraphDef) -> CreateSessionRequest {
    let mut resource_map = HashMap::new();
    resource_map.insert("MEMORY:GPU0.persistent".to_string(), (32 * MIB) as f64);
    resource_map.insert("MEMORY:GPU0.temporary".to_string(), (32 * MIB) as f64);
    CreateSessionRequest {
        graph: Some(graph),
        config: SessionConfig {
            salus_options: SalusOptions { resource_map, is_inference: false },
        },
    }
}

/// A graph whose Recv never gets a Send: the iteration parks until the
/// rendezvous aborts.
fn blocked_graph() -> GraphDef {
    GraphDef {
        name: "blocked".into(),
        nodes: vec![
            node("stuck", "Recv", &[], json!({"tensor_name": "never", "dtype": "f32"})),
            node("out", "Identity", &["stuck"], json!({})),
        ],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_close_cancels_queued_and_unblocks_running() {
    let runtime = test_runtime();
    let initial = runtime.monitor.available();

    let created = runtime.create_session(small_session(blocked_graph())).await.expect("admitted");
    let handle = created.session_handle.clone();

    // One running (parked on the rendezvous) plus several queued behind the
    // expensive gate.
    let mut steps = Vec::new();
    for _ in 0..5 {
        let rt = runtime.clone();
        let h = handle.clone();
        let gid = created.graph_id;
        steps.push(tokio::spawn(async move {
            rt.run_step(RunStepRequest {
                session_handle: h,
                graph_id: gid,
                partial_handle: None,
                feeds: HashMap::new(),
                fetches: vec!["out".into()],
                is_expensive: true,
            })
            .await
        }));
    }

    // Give the first iteration time to start and park.
    tokio::time::sleep(Duration::from_millis(100)).await;

    runtime.force_close_session(&handle).expect("force close");

    for step in steps {
        let result = step.await.expect("join");
        let err = result.expect_err("every step observes cancellation");
        assert_eq!(err.code, Code::Cancelled, "got {:?}", err);
    }

    // Accounting settles once everything drained.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        runtime.monitor.available(),
        initial,
        "forced close leaves accounting intact:\n{}",
        runtime.monitor.dump()
    );
    assert_eq!(runtime.num_sessions(), 0);

    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_steps_after_close_are_rejected() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "tiny".into(),
        nodes: vec![node("c", "Const", &[], json!({"value": 1.0, "shape": [1]}))],
    };
    let created = runtime.create_session(small_session(graph)).await.unwrap();
    let handle = created.session_handle.clone();

    runtime.force_close_session(&handle).unwrap();

    let err = runtime
        .run_step(RunStepRequest {
            session_handle: handle,
            graph_id: created.graph_id,
            partial_handle: None,
            feeds: HashMap::new(),
            fetches: vec!["c".into()],
            is_expensive: false,
        })
        .await
        .expect_err("closed session rejects work");
    assert_eq!(err.code, Code::NotFound);

    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_run_setup_reserves_fetch_plan() {
    let runtime = test_runtime();
    let graph = GraphDef {
        name: "partial".into(),
        nodes: vec![
            node("a", "Const", &[], json!({"value": 6.0, "shape": [1]})),
            node("b", "Const", &[], json!({"value": 7.0, "shape": [1]})),
            node("prod", "Mul", &["a", "b"], json!({})),
        ],
    };
    let created = runtime.create_session(small_session(graph)).await.unwrap();
    let handle = created.session_handle.clone();

    let setup = runtime
        .partial_run_setup(PartialRunSetupRequest {
            session_handle: handle.clone(),
            feeds: vec![],
            fetches: vec!["prod".into()],
        })
        .await
        .expect("partial handle");

    // RunStep against the partial handle inherits the planned fetches.
    let resp = runtime
        .run_step(RunStepRequest {
            session_handle: String::new(),
            graph_id: created.graph_id,
            partial_handle: Some(setup.partial_handle),
            feeds: HashMap::new(),
            fetches: vec![],
            is_expensive: false,
        })
        .await
        .expect("partial run executes");
    assert_eq!(resp.fetched["prod"].f32s, vec![42.0]);

    runtime
        .close_session(salus::session::CloseSessionRequest { session_handle: handle })
        .await
        .unwrap();
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_partial_handle() {
    let runtime = test_runtime();
    let err = runtime
        .run_step(RunStepRequest {
            session_handle: String::new(),
            graph_id: None,
            partial_handle: Some("partial-nope".into()),
            feeds: HashMap::new(),
            fetches: vec![],
            is_expensive: false,
        })
        .await
        .expect_err("unknown partial handle");
    assert_eq!(err.code, Code::NotFound);
    runtime.shutdown();
}
