// Lane manager admission, sharing, and lifecycle.
//
// Lane invariant: available + Σ(hold.persistent) == total, with the peak
// envelope never overcommitted for shared lanes.

use std::sync::mpsc;
use std::sync::Arc;

use salus::core::GIB;
use salus::device::{CpuDevice, GpuDevice};
use salus::lanes::{LaneHolder, LaneLayout, LaneMgr};

fn mgr_with_gpus(memories: &[u64]) -> Arc<LaneMgr> {
    let gpus = memories
        .iter()
        .enumerate()
        .map(|(i, &m)| Arc::new(GpuDevice::new(i, m)))
        .collect();
    LaneMgr::new(gpus, Arc::new(CpuDevice::new(8 * GIB)))
}

/// Admission resolves inline when capacity allows; the channel catches the
/// deferred case too.
fn request(
    mgr: &Arc<LaneMgr>,
    limits: Vec<u64>,
    persistent: Vec<u64>,
) -> mpsc::Receiver<Vec<LaneHolder>> {
    let (tx, rx) = mpsc::channel();
    mgr.request_lanes(
        LaneLayout { memory_limits: limits, persistent },
        false,
        Box::new(move |holders| {
            tx.send(holders).ok();
        }),
    )
    .expect("request accepted");
    rx
}

#[test]
fn test_whole_gpu_lane_blocks_further_admission() {
    let mgr = mgr_with_gpus(&[15 * GIB]);

    let rx = request(&mgr, vec![15 * GIB], vec![15 * GIB]);
    let holders = rx.recv().expect("whole-GPU lane granted");
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].total_memory(), 15 * GIB);
    assert_eq!(mgr.available_memory_for_gpu(0), 0);

    // Nothing else fits: not a new lane, and the existing lane has no slack.
    let rx2 = request(&mgr, vec![1 * GIB], vec![512 * 1024 * 1024]);
    assert!(rx2.try_recv().is_err(), "second admission must stay pending");

    // Releasing the hold frees the GPU and satisfies the queued request.
    drop(holders);
    let late = rx2.recv().expect("pending request satisfied on release");
    assert_eq!(late.len(), 1);
    drop(late);
}

#[test]
fn test_shared_lane_reserves_worst_peak_once() {
    // GPU too full for a second lane, so the second job must share.
    let mgr = mgr_with_gpus(&[5 * GIB]);

    // A: 4 GiB lane, 1 GiB persistent, 3 GiB peak.
    let a = request(&mgr, vec![4 * GIB], vec![1 * GIB]).recv().unwrap();
    assert_eq!(mgr.num_lanes_on_gpu(0), 1);
    assert_eq!(a[0].available_memory(), 3 * GIB);
    assert_eq!(mgr.available_memory_for_gpu(0), 1 * GIB);

    // B: pure-peak job (no persistent): 0 + max(3GiB, 3GiB) <= 3GiB fits.
    let b = request(&mgr, vec![3 * GIB], vec![0]).recv().unwrap();
    assert_eq!(mgr.num_lanes_on_gpu(0), 1, "B must reuse A's lane");
    assert_eq!(b[0].lane_id(), a[0].lane_id());
    assert_eq!(b[0].available_memory(), 3 * GIB);

    // C: any persistent demand breaks the envelope: 1 + max(2,3) > 3.
    let rx_c = request(&mgr, vec![3 * GIB], vec![1 * GIB]);
    assert!(rx_c.try_recv().is_err());

    drop(b);
    drop(a);
    // Once A and B release, C gets a fresh lane.
    let c = rx_c.recv().expect("C admitted after releases");
    assert_eq!(c.len(), 1);
    drop(c);

    assert_eq!(mgr.available_memory_for_gpu(0), 5 * GIB);
    assert_eq!(mgr.num_lanes_on_gpu(0), 0, "idle lanes are destroyed");
}

#[test]
fn test_request_rejects_more_gpus_than_present() {
    let mgr = mgr_with_gpus(&[15 * GIB]);
    let result = mgr.request_lanes(
        LaneLayout { memory_limits: vec![1 * GIB, 1 * GIB], persistent: vec![0, 0] },
        false,
        Box::new(|_| {}),
    );
    assert!(result.is_err(), "N entries on fewer than N GPUs is rejected at admission");
}

#[test]
fn test_persistent_must_not_exceed_limit() {
    let mgr = mgr_with_gpus(&[15 * GIB]);
    let result = mgr.request_lanes(
        LaneLayout { memory_limits: vec![1 * GIB], persistent: vec![2 * GIB] },
        false,
        Box::new(|_| {}),
    );
    assert!(result.is_err());
}

#[test]
fn test_multi_entry_request_is_all_or_nothing() {
    let mgr = mgr_with_gpus(&[4 * GIB, 2 * GIB]);

    // Largest entry placed first: 3 GiB lands on GPU0, 2 GiB on GPU1.
    let holders =
        request(&mgr, vec![2 * GIB, 3 * GIB], vec![1 * GIB, 1 * GIB]).recv().unwrap();
    assert_eq!(holders.len(), 2);
    let mut gpus: Vec<usize> = holders.iter().map(|h| h.gpu_index()).collect();
    gpus.sort_unstable();
    assert_eq!(gpus, vec![0, 1]);

    // A two-entry request that cannot fully fit stays queued, and the GPUs
    // keep their memory (nothing partially held).
    let rx = request(&mgr, vec![2 * GIB, 2 * GIB], vec![2 * GIB, 2 * GIB]);
    assert!(rx.try_recv().is_err());
    assert_eq!(mgr.available_memory_for_gpu(0), 1 * GIB);
    assert_eq!(mgr.available_memory_for_gpu(1), 0);

    drop(holders);
    let late = rx.recv().expect("queued request satisfied after release");
    assert_eq!(late.len(), 2);
    drop(late);

    assert_eq!(mgr.available_memory_for_gpu(0), 4 * GIB);
    assert_eq!(mgr.available_memory_for_gpu(1), 2 * GIB);
    assert_eq!(mgr.num_lanes_on_gpu(0) + mgr.num_lanes_on_gpu(1), 0);
}

#[test]
fn test_inference_flag_is_carried() {
    let mgr = mgr_with_gpus(&[15 * GIB]);
    let (tx, rx) = mpsc::channel();
    mgr.request_lanes(
        LaneLayout { memory_limits: vec![1 * GIB], persistent: vec![0] },
        true,
        Box::new(move |holders| {
            tx.send(holders).ok();
        }),
    )
    .unwrap();
    let holders = rx.recv().unwrap();
    // Presence only: placement policy matches training.
    assert_eq!(holders.len(), 1);
}
