// Buffer-tree paging: whole-alias-set migration, re-fault, eviction, and
// the end-to-end OOM-and-page scenario.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use salus::core::{Resources, SchedulingParam, GIB, MIB, CPU0, GPU0};
use salus::device::{
    AllocAttributes, ComputeDevice, CpuDevice, DeviceRef, GpuDevice, PerOpAllocator,
    PlatformConfig,
};
use salus::graph::{GraphDef, NodeDef};
use salus::monitor::{platform_limits, ResourceContext, ResourceMonitor};
use salus::paging::ActiveBuffers;
use salus::session::{
    CloseSessionRequest, CreateSessionRequest, ExtendSessionRequest, Frontend, RunStepRequest,
    SalusOptions, SessionConfig,
};
use salus::tensor::{DataType, Entry, EntryRef, EntryValue, Shape, Tensor};
use salus::{Runtime, RuntimeConfig};

struct Rig {
    monitor: Arc<ResourceMonitor>,
    gpu: Arc<GpuDevice>,
    cpu: Arc<CpuDevice>,
}

impl Rig {
    fn new() -> Self {
        Self {
            monitor: Arc::new(ResourceMonitor::new(platform_limits(1 * GIB, &[64 * MIB]))),
            gpu: Arc::new(GpuDevice::new(0, 64 * MIB)),
            cpu: Arc::new(CpuDevice::new(1 * GIB)),
        }
    }

    fn gpu_allocator(&self, ticket: u64) -> Arc<PerOpAllocator> {
        PerOpAllocator::new(
            self.gpu.clone() as DeviceRef,
            None,
            self.cpu.clone(),
            ResourceContext::new(self.monitor.clone(), ticket, GPU0),
            ResourceContext::new(self.monitor.clone(), ticket, CPU0),
        )
    }

    fn cpu_allocator(&self, ticket: u64) -> Arc<PerOpAllocator> {
        let rctx = ResourceContext::new(self.monitor.clone(), ticket, CPU0);
        PerOpAllocator::new(self.cpu.clone() as DeviceRef, None, self.cpu.clone(), rctx.clone(), rctx)
    }
}

fn value_entry(tensor: Tensor, ticket: u64) -> EntryRef {
    Arc::new(Mutex::new(Entry {
        value: EntryValue::Val(tensor),
        alloc_ticket: ticket,
        ..Default::default()
    }))
}

#[test]
fn test_page_out_and_back_preserves_alias_set() {
    let rig = Rig::new();
    let active = ActiveBuffers::new();

    let ticket = rig.monitor.pre_allocate(&Resources::new()).unwrap();
    let alloc = rig.gpu_allocator(ticket);

    let pattern: Vec<f32> = (0..1024).map(|i| i as f32 * 0.5).collect();
    let root = Tensor::allocate(&alloc, DataType::F32, Shape::vector(1024), AllocAttributes::default())
        .expect("fits on GPU");
    root.write_f32(&pattern).unwrap();
    let view = root.slice(100, 64).expect("sub view");

    let e_root = value_entry(root.clone(), ticket);
    let e_view = value_entry(view.clone(), ticket);
    active.register_entry(&e_root);
    active.register_entry(&e_view);

    let tree = e_root.lock().tree.clone().expect("root entry linked");
    assert!(Arc::ptr_eq(
        &tree,
        &e_view.lock().tree.clone().expect("view entry linked")
    ), "aliasing entries share one tree");
    assert_eq!(tree.live_entries(), 2);
    assert_eq!(tree.ticket(), ticket);

    // The test's own handles must not pin the old buffers alive.
    drop(root);
    drop(view);

    // --- Page out to host ---
    let target = rig.monitor.pre_allocate(&Resources::new()).unwrap();
    let target_alloc = rig.cpu_allocator(target);
    let freed = active.page_out(ticket, &target_alloc).expect("page out");
    assert_eq!(freed, 4096);
    assert!(tree.is_paged_out());
    assert_eq!(tree.ticket(), target);

    assert_eq!(rig.gpu.available_memory(), 64 * MIB, "GPU bytes reclaimed");
    assert!(rig.monitor.query_usage(ticket).is_none(), "old ticket fully freed");
    let cpu_tag = salus::core::ResourceTag::memory(CPU0);
    assert_eq!(rig.monitor.query_usage(target).unwrap().get(&cpu_tag), 4096);

    {
        let e = e_root.lock();
        let t = e.ref_or_val().unwrap();
        assert_eq!(t.device(), CPU0);
        assert_eq!(t.read_f32(), pattern, "contents survive the migration");
        assert_eq!(e.alloc_ticket, target);
    }
    {
        let t = e_view.lock().ref_or_val().unwrap();
        assert_eq!(t.device(), CPU0);
        assert_eq!(t.read_f32(), pattern[100..164].to_vec(), "sub view retargeted");
    }

    // --- Page back in (re-fault) ---
    let back = active.page_in(&tree, &alloc).expect("page in");
    assert_eq!(back, 4096);
    assert!(!tree.is_paged_out());
    assert_eq!(tree.ticket(), ticket);

    {
        let t = e_root.lock().ref_or_val().unwrap();
        assert_eq!(t.device(), GPU0);
        assert_eq!(t.read_f32(), pattern, "round trip is lossless");
    }
    {
        let t = e_view.lock().ref_or_val().unwrap();
        assert_eq!(t.read_f32(), pattern[100..164].to_vec());
    }

    // Double-checked: a second page-in is a no-op.
    assert_eq!(active.page_in(&tree, &alloc).unwrap(), 0);
}

#[test]
fn test_pinned_tree_is_skipped_by_page_out() {
    let rig = Rig::new();
    let active = ActiveBuffers::new();
    let ticket = rig.monitor.pre_allocate(&Resources::new()).unwrap();
    let alloc = rig.gpu_allocator(ticket);

    let t = Tensor::allocate(&alloc, DataType::F32, Shape::vector(16), AllocAttributes::default())
        .unwrap();
    let entry = value_entry(t, ticket);
    active.register_entry(&entry);
    let tree = entry.lock().tree.clone().unwrap();

    // A running kernel holds the pin; its buffers must not move.
    tree.pin();
    assert_eq!(active.page_out(ticket, &rig.cpu_allocator(ticket)).unwrap(), 0);
    assert!(!tree.is_paged_out());

    tree.unpin();
    let target = rig.monitor.pre_allocate(&Resources::new()).unwrap();
    assert!(active.page_out(ticket, &rig.cpu_allocator(target)).unwrap() > 0);
    assert!(tree.is_paged_out());
}

#[test]
fn test_eviction_notification_invalidates_entries() {
    let rig = Rig::new();
    let active = ActiveBuffers::new();
    let ticket = rig.monitor.pre_allocate(&Resources::new()).unwrap();
    let alloc = rig.gpu_allocator(ticket);

    let t = Tensor::allocate(&alloc, DataType::F32, Shape::vector(8), AllocAttributes::default())
        .unwrap();
    let entry = value_entry(t.clone(), ticket);
    active.register_entry(&entry);
    let root_id = t.buffer().id();
    drop(t);

    active.evicted(ticket, root_id);
    assert!(!entry.lock().has_value(), "evicted buffer leaves the entry empty");
    assert!(active.trees_for(ticket).is_empty());
}

// ----------------------------------------------------------------------------
// End to end: one job fills the GPU, the other's peak forces paging.
// ----------------------------------------------------------------------------

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

fn resource_map(persistent_mb: u64, temporary_mb: u64) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    map.insert("MEMORY:GPU0.persistent".to_string(), (persistent_mb * MIB) as f64);
    map.insert("MEMORY:GPU0.temporary".to_string(), (temporary_mb * MIB) as f64);
    map
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oom_triggers_paging_and_transparent_page_in() {
    let runtime = Runtime::boot(RuntimeConfig {
        platform: PlatformConfig {
            gpu_count: 1,
            gpu_memory_cap: 64 * MIB,
            gpu_reported_memory: Some(512 * MIB),
            cpu_memory: Some(2 * GIB),
        },
        param: SchedulingParam::default(),
    });

    // Job A: a 48 MiB weight plus a tiny recognisable variable.
    let a_graph = GraphDef {
        name: "job_a".into(),
        nodes: vec![
            node("vbig", "Variable", &[], json!({"dtype": "f32", "shape": [12582912]})),
            node("touch_big", "Identity", &["vbig"], json!({})),
            node("vsm", "Variable", &[], json!({"dtype": "f32", "shape": [4]})),
            node("nines", "Const", &[], json!({"value": [9.0, 9.0, 9.0, 9.0]})),
            node("seed", "Assign", &["vsm", "nines"], json!({})),
        ],
    };
    let a = runtime
        .create_session(CreateSessionRequest {
            graph: Some(a_graph),
            config: SessionConfig {
                salus_options: SalusOptions {
                    resource_map: resource_map(48, 0),
                    is_inference: false,
                },
            },
        })
        .await
        .expect("A admitted");

    let resp = runtime
        .run_step(RunStepRequest {
            session_handle: a.session_handle.clone(),
            graph_id: a.graph_id,
            partial_handle: None,
            feeds: HashMap::new(),
            fetches: vec!["seed".into()],
            is_expensive: true,
        })
        .await
        .expect("A warms up");
    assert_eq!(resp.fetched["seed"].f32s, vec![9.0; 4]);

    // Job B: small budget, 24 MiB transient peak. The device cannot hold
    // A's weights and B's peak together.
    let b_graph = GraphDef {
        name: "job_b".into(),
        nodes: vec![
            node("blob", "Fill", &[], json!({"shape": [6291456], "value": 0.0})),
            node("probe", "Const", &[], json!({"value": 1.0, "shape": [1]})),
        ],
    };
    let b = runtime
        .create_session(CreateSessionRequest {
            graph: Some(b_graph),
            config: SessionConfig {
                salus_options: SalusOptions {
                    resource_map: resource_map(2, 4),
                    is_inference: false,
                },
            },
        })
        .await
        .expect("B admitted");

    // This step only succeeds if A's tensors were volunteered out.
    let resp = runtime
        .run_step(RunStepRequest {
            session_handle: b.session_handle.clone(),
            graph_id: b.graph_id,
            partial_handle: None,
            feeds: HashMap::new(),
            fetches: vec!["probe".into()],
            is_expensive: true,
        })
        .await
        .expect("B's peak is honoured by paging A out");
    assert_eq!(resp.fetched["probe"].f32s, vec![1.0]);

    // A touches its small variable again: the paged-out tree faults back in
    // transparently, contents intact.
    let a_read = GraphDef {
        name: "job_a_read".into(),
        nodes: vec![
            node("vsm", "Variable", &[], json!({"dtype": "f32", "shape": [4]})),
            node("snap", "Identity", &["vsm"], json!({})),
        ],
    };
    let ext = runtime
        .extend_session(ExtendSessionRequest {
            session_handle: a.session_handle.clone(),
            graph: a_read,
        })
        .await
        .expect("extend A");
    let resp = runtime
        .run_step(RunStepRequest {
            session_handle: a.session_handle.clone(),
            graph_id: Some(ext.graph_id),
            partial_handle: None,
            feeds: HashMap::new(),
            fetches: vec!["snap".into()],
            is_expensive: true,
        })
        .await
        .expect("A reads after page-in");
    assert_eq!(resp.fetched["snap"].f32s, vec![9.0; 4], "page-in preserved contents");

    let initial = runtime.monitor.platform().clone();
    runtime
        .close_session(CloseSessionRequest { session_handle: a.session_handle })
        .await
        .unwrap();
    runtime
        .close_session(CloseSessionRequest { session_handle: b.session_handle })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        runtime.monitor.available(),
        initial,
        "all accounts restored:\n{}",
        runtime.monitor.dump()
    );

    runtime.shutdown();
}
