// Engine scheduling behaviour and the single-job runtime scenario.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use salus::core::{SchedulingParam, GIB, MIB};
use salus::device::{CpuDevice, GpuDevice, PlatformConfig};
use salus::engine::{ExecutionEngine, IterationContext, IterationTask};
use salus::graph::{GraphDef, NodeDef};
use salus::lanes::LaneMgr;
use salus::monitor::{platform_limits, AllocationRegulator, ResourceMonitor};
use salus::session::{
    CloseSessionRequest, CreateSessionRequest, Frontend, RunStepRequest, SalusOptions,
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

fn test_runtime(max_hol_waiting: usize) -> Arc<Runtime> {
    Runtime::boot(RuntimeConfig {
        platform: PlatformConfig {
            gpu_count: 1,
            gpu_memory_cap: 15 * GIB,
            gpu_reported_memory: Some(16 * GIB),
            cpu_memory: Some(8 * GIB),
        },
        param: SchedulingParam { max_hol_waiting, ..Default::default() },
    })
}

// ----------------------------------------------------------------------------
// Engine-level gating, driven by hand-made iteration tasks.
// ----------------------------------------------------------------------------

struct FlagTask {
    expensive: bool,
    ran: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    /// When set, completion is withheld until the test releases it.
    hold_done: Option<Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>>,
}

impl IterationTask for FlagTask {
    fn graph_id(&self) -> u64 {
        0
    }

    fn is_expensive(&self) -> bool {
        self.expensive
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn run_async(self: Box<Self>, ictx: IterationContext) {
        self.ran.store(true, Ordering::SeqCst);
        match &self.hold_done {
            Some(cell) => {
                *cell.lock() = Some(ictx.done);
            }
            None => (ictx.done)(),
        }
    }
}

fn test_engine(param: SchedulingParam) -> Arc<ExecutionEngine> {
    let limits = platform_limits(8 * GIB, &[4 * GIB]);
    let monitor = Arc::new(ResourceMonitor::new(limits.clone()));
    let regulator = Arc::new(AllocationRegulator::new(limits));
    let lane_mgr = LaneMgr::new(
        vec![Arc::new(GpuDevice::new(0, 4 * GIB))],
        Arc::new(CpuDevice::new(8 * GIB)),
    );
    let engine = ExecutionEngine::new(param, monitor, regulator, lane_mgr);
    engine.start_scheduler();
    engine
}

fn wait_for(flag: &Arc<AtomicBool>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    flag.load(Ordering::SeqCst)
}

#[test]
fn test_exclusive_mode_blocks_other_sessions() {
    let engine = test_engine(SchedulingParam::default());

    let a = engine.make_context();
    let b = engine.make_context();
    a.set_lane_id(7);
    b.set_lane_id(7);

    // A's first iteration claims the lane's exclusivity token.
    let a_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: false,
        ran: a_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    assert!(wait_for(&a_ran, Duration::from_secs(2)));

    // B shares the lane but may not start while A holds the token.
    let b_ran = Arc::new(AtomicBool::new(false));
    b.schedule_iteration(Box::new(FlagTask {
        expensive: false,
        ran: b_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    assert!(!wait_for(&b_ran, Duration::from_millis(150)));

    a.drop_exclusive_mode();
    assert!(wait_for(&b_ran, Duration::from_secs(2)), "B runs once A shares");

    engine.stop_scheduler();
    engine.pool().shutdown();
}

#[test]
fn test_expensive_iterations_gate_per_session() {
    let engine = test_engine(SchedulingParam::default());
    let a = engine.make_context();
    a.set_lane_id(1);
    a.drop_exclusive_mode();

    let first_done = Arc::new(Mutex::new(None));
    let first_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: true,
        ran: first_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: Some(first_done.clone()),
    }));
    assert!(wait_for(&first_ran, Duration::from_secs(2)));

    // A second expensive iteration of the same session must wait.
    let second_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: true,
        ran: second_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    assert!(!wait_for(&second_ran, Duration::from_millis(150)));

    // An inexpensive one bypasses the blocked head.
    let cheap_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: false,
        ran: cheap_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    assert!(wait_for(&cheap_ran, Duration::from_secs(2)));

    // Completing the first unblocks the second.
    let done = first_done.lock().take().expect("first iteration parked its completion");
    done();
    assert!(wait_for(&second_ran, Duration::from_secs(2)));

    engine.stop_scheduler();
    engine.pool().shutdown();
}

#[test]
fn test_hol_limit_zero_disables_bypass() {
    let engine = test_engine(SchedulingParam { max_hol_waiting: 0, ..Default::default() });
    let a = engine.make_context();
    a.set_lane_id(1);
    a.drop_exclusive_mode();

    let first_done = Arc::new(Mutex::new(None));
    let first_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: true,
        ran: first_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: Some(first_done.clone()),
    }));
    assert!(wait_for(&first_ran, Duration::from_secs(2)));

    // Head (second expensive) is blocked; with max_hol_waiting = 0 nothing
    // behind it may be attempted.
    let second_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: true,
        ran: second_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    let cheap_ran = Arc::new(AtomicBool::new(false));
    a.schedule_iteration(Box::new(FlagTask {
        expensive: false,
        ran: cheap_ran.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        hold_done: None,
    }));
    assert!(!wait_for(&cheap_ran, Duration::from_millis(150)), "no bypass with limit 0");

    let done = first_done.lock().take().unwrap();
    done();
    assert!(wait_for(&second_ran, Duration::from_secs(2)));
    assert!(wait_for(&cheap_ran, Duration::from_secs(2)));

    engine.stop_scheduler();
    engine.pool().shutdown();
}

// ----------------------------------------------------------------------------
// Runtime-level: single job, single GPU (spec scenario).
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_job_five_steps_restores_accounting() {
    let runtime = test_runtime(50);
    let initial = runtime.monitor.available();

    let graph = GraphDef {
        name: "fill".into(),
        nodes: vec![
            // 512 MiB of f32 per step.
            node("scratch", "Fill", &[], json!({"shape": [134217728], "value": 0.0})),
            node("probe", "Const", &[], json!({"value": 1.0, "shape": [1]})),
        ],
    };

    let mut resource_map = HashMap::new();
    resource_map.insert("MEMORY:GPU0.persistent".to_string(), (1 * GIB) as f64);
    resource_map.insert("MEMORY:GPU0.temporary".to_string(), (1 * GIB) as f64);
    resource_map.insert("TIME:TOTAL.persistent".to_string(), 0.5);
    resource_map.insert("SCHED:PRIORITY.persistent".to_string(), 10.0);

    let created = runtime
        .create_session(CreateSessionRequest {
            graph: Some(graph),
            config: SessionConfig {
                salus_options: SalusOptions { resource_map, is_inference: false },
            },
        })
        .await
        .expect("session admitted");

    assert_eq!(runtime.lane_mgr.num_lanes_on_gpu(0), 1);

    for step in 0..5 {
        let resp = runtime
            .run_step(RunStepRequest {
                session_handle: created.session_handle.clone(),
                graph_id: created.graph_id,
                partial_handle: None,
                feeds: HashMap::new(),
                fetches: vec!["probe".into()],
                is_expensive: true,
            })
            .await
            .unwrap_or_else(|e| panic!("step {} failed: {}", step, e));
        assert_eq!(resp.fetched["probe"].f32s, vec![1.0]);
    }

    runtime
        .close_session(CloseSessionRequest { session_handle: created.session_handle })
        .await
        .expect("close");

    // Buffers unwind through allocator grants shortly after completion.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        runtime.monitor.available(),
        initial,
        "global limits restored after close:\n{}",
        runtime.monitor.dump()
    );
    assert_eq!(runtime.lane_mgr.num_lanes_on_gpu(0), 0, "no lane remains");
    assert_eq!(runtime.lane_mgr.available_memory_for_gpu(0), 15 * GIB);

    runtime.shutdown();
}

#[tokio::test]
async fn test_admission_failure_does_not_create_session() {
    let runtime = test_runtime(50);

    let mut resource_map = HashMap::new();
    resource_map.insert("MEMORY:GPU0.persistent".to_string(), (40 * GIB) as f64);

    let result = runtime
        .create_session(CreateSessionRequest {
            graph: None,
            config: SessionConfig {
                salus_options: SalusOptions { resource_map, is_inference: false },
            },
        })
        .await;

    match result {
        Err(e) => assert!(e.is_resource_exhausted(), "got {:?}", e),
        Ok(_) => panic!("over-capacity session must be rejected"),
    }
    assert_eq!(runtime.num_sessions(), 0);
    runtime.shutdown();
}

#[tokio::test]
async fn test_dispatch_by_name() {
    let runtime = test_runtime(50);

    let devices = runtime.dispatch("ListDevices", json!({})).await.expect("dispatch works");
    let names: Vec<String> = devices["devices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"/job:salus/replica:0/task:0/device:CPU:0".to_string()));
    assert!(names.contains(&"/job:salus/replica:0/task:0/device:GPU:0".to_string()));

    let err = runtime.dispatch("Bogus", json!({})).await.expect_err("unknown request");
    assert_eq!(err.code, salus::core::Code::NotFound);

    let mut resource_map = HashMap::new();
    resource_map.insert("MEMORY:GPU0.persistent".to_string(), (64 * MIB) as f64);
    let created = runtime
        .dispatch(
            "CreateSession",
            json!({
                "graph": {"nodes": [{"name": "c", "op": "Const", "attrs": {"value": 2.0, "shape": [1]}}]},
                "config": {"salus_options": {"resource_map": resource_map}}
            }),
        )
        .await
        .expect("create via dispatch");
    let handle = created["session_handle"].as_str().unwrap().to_string();

    let resp = runtime
        .dispatch(
            "RunStep",
            json!({"session_handle": handle, "fetches": ["c"]}),
        )
        .await
        .expect("run via dispatch");
    assert_eq!(resp["fetched"]["c"]["f32s"][0], 2.0);

    runtime
        .dispatch("Reset", json!({}))
        .await
        .expect("reset closes everything");
    assert_eq!(runtime.num_sessions(), 0);

    runtime.shutdown();
}
