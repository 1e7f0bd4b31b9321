// Accounting invariants of the resource monitor and allocation regulator.
//
// The conservation law under test: at every instant,
//     global_limits + Σ(staging) + Σ(in_use) == platform_limits

use std::collections::HashSet;
use std::str::FromStr;

use salus::core::{ResourceTag, Resources, GIB, MIB};
use salus::monitor::{platform_limits, AllocationRegulator, ResourceMonitor};

fn mem_gpu0(bytes: u64) -> Resources {
    Resources::single(ResourceTag::from_str("MEMORY:GPU0").unwrap(), bytes)
}

fn limits() -> Resources {
    platform_limits(50 * GIB, &[15 * GIB])
}

fn conserved(monitor: &ResourceMonitor, tickets: &[u64]) -> bool {
    let mut total = monitor.available();
    for &t in tickets {
        if let Some(s) = monitor.query_staging(t) {
            total.merge(&s);
        }
        if let Some(u) = monitor.query_usage(t) {
            total.merge(&u);
        }
    }
    total == *monitor.platform()
}

#[test]
fn test_tag_string_round_trip() {
    let tag = ResourceTag::from_str("MEMORY:GPU0").unwrap();
    assert_eq!(tag.to_string(), "MEMORY:GPU0");

    let tag = ResourceTag::from_str("GPU_STREAM:GPU1").unwrap();
    assert_eq!(tag.to_string(), "GPU_STREAM:GPU1");

    // A bare type defaults to CPU:0.
    let tag = ResourceTag::from_str("COMPUTE").unwrap();
    assert_eq!(tag.to_string(), "COMPUTE:CPU0");

    assert!(ResourceTag::from_str("BOGUS:GPU0").is_err());
}

#[test]
fn test_resources_map_semantics() {
    let mut avail = mem_gpu0(4 * GIB);

    // Missing tags count as zero and only pass when the request is zero.
    let req = Resources::single(ResourceTag::from_str("MEMORY:CPU0").unwrap(), 1);
    assert!(!avail.contains(&req));
    assert!(avail.contains(&Resources::new()));
    assert!(avail.contains(&mem_gpu0(4 * GIB)));
    assert!(!avail.contains(&mem_gpu0(4 * GIB + 1)));

    // Zero entries disappear after mutation.
    avail.subtract(&mem_gpu0(4 * GIB));
    assert!(avail.is_empty());

    // subtract_bounded clamps and reports what it took.
    let mut have = mem_gpu0(1 * GIB);
    let taken = have.subtract_bounded(&mem_gpu0(3 * GIB));
    assert_eq!(taken, mem_gpu0(1 * GIB));
    assert!(have.is_empty());
}

#[test]
fn test_preallocate_allocate_free_round_trip() {
    let monitor = ResourceMonitor::new(limits());
    let initial = monitor.available();

    let req = mem_gpu0(2 * GIB);
    let ticket = monitor.pre_allocate(&req).expect("preallocate fits");
    assert!(ticket > 0);
    assert!(conserved(&monitor, &[ticket]));

    assert!(monitor.allocate(ticket, &req));
    assert!(conserved(&monitor, &[ticket]));

    let emptied = monitor.free(ticket, &req);
    assert!(emptied, "account should drop once empty");
    assert!(!monitor.has_usage(ticket));

    monitor.free_staging(ticket);
    assert_eq!(monitor.available(), initial, "round trip must restore global limits");
}

#[test]
fn test_preallocate_failure_reports_missing_and_leaves_state() {
    let monitor = ResourceMonitor::new(limits());
    let before = monitor.available();

    let req = mem_gpu0(20 * GIB);
    let missing = monitor.pre_allocate(&req).expect_err("cannot exceed GPU capacity");
    assert_eq!(missing, mem_gpu0(5 * GIB));
    assert_eq!(monitor.available(), before, "failed preallocate must not touch accounts");
}

#[test]
fn test_allocate_partial_staging_then_global() {
    let monitor = ResourceMonitor::new(limits());
    let ticket = monitor.pre_allocate(&mem_gpu0(1 * GIB)).unwrap();

    // 3 GiB: 1 GiB from staging, 2 GiB residual from global limits.
    assert!(monitor.allocate(ticket, &mem_gpu0(3 * GIB)));
    assert!(monitor.query_staging(ticket).is_none() || monitor.query_staging(ticket).unwrap().is_empty());
    assert_eq!(monitor.query_usage(ticket).unwrap(), mem_gpu0(3 * GIB));

    let tag = ResourceTag::from_str("MEMORY:GPU0").unwrap();
    assert_eq!(monitor.available().get(&tag), 12 * GIB);
    assert!(conserved(&monitor, &[ticket]));

    // Over-commit beyond global fails and changes nothing.
    let before = monitor.available();
    assert!(!monitor.allocate(ticket, &mem_gpu0(13 * GIB)));
    assert_eq!(monitor.available(), before);

    monitor.free(ticket, &mem_gpu0(3 * GIB));
    assert_eq!(monitor.available().get(&tag), 15 * GIB);
}

#[test]
fn test_ticket_zero_rejected() {
    let monitor = ResourceMonitor::new(limits());
    assert!(!monitor.allocate(0, &mem_gpu0(1 * MIB)));
}

#[test]
#[should_panic]
fn test_in_use_underflow_fails_loudly() {
    let monitor = ResourceMonitor::new(limits());
    let ticket = monitor.pre_allocate(&mem_gpu0(1 * GIB)).unwrap();
    monitor.allocate(ticket, &mem_gpu0(1 * GIB));
    // Freeing more than in use is a programming bug.
    monitor.free(ticket, &mem_gpu0(2 * GIB));
}

#[test]
fn test_sort_victims_by_gpu_usage() {
    let monitor = ResourceMonitor::new(limits());

    let t1 = monitor.pre_allocate(&mem_gpu0(1 * GIB)).unwrap();
    let t2 = monitor.pre_allocate(&mem_gpu0(4 * GIB)).unwrap();
    let t3 = monitor.pre_allocate(&mem_gpu0(2 * GIB)).unwrap();
    monitor.allocate(t1, &mem_gpu0(1 * GIB));
    monitor.allocate(t2, &mem_gpu0(4 * GIB));
    monitor.allocate(t3, &mem_gpu0(2 * GIB));

    // A ticket with no GPU usage is filtered out.
    let t4 = monitor.pre_allocate(&Resources::new()).unwrap();

    let candidates: HashSet<u64> = [t1, t2, t3, t4].into_iter().collect();
    let victims = monitor.sort_victims(&candidates, salus::core::GPU0);

    let order: Vec<u64> = victims.iter().map(|&(_, t)| t).collect();
    assert_eq!(order, vec![t2, t3, t1], "victims sorted by decreasing GPU memory");
}

#[test]
fn test_locked_proxy_batches_mutations() {
    let monitor = ResourceMonitor::new(limits());
    let src = monitor.pre_allocate(&mem_gpu0(2 * GIB)).unwrap();
    let dst = monitor.pre_allocate(&Resources::new()).unwrap();
    monitor.allocate(src, &mem_gpu0(2 * GIB));

    let cpu_mem = Resources::single(ResourceTag::from_str("MEMORY:CPU0").unwrap(), 2 * GIB);

    // Reconcile a migration under one lock acquisition: free on the source
    // device, charge the target, observe both consistently.
    {
        let mut proxy = monitor.lock();
        assert!(proxy.allocate(dst, &cpu_mem));
        let emptied = proxy.free(src, &mem_gpu0(2 * GIB));
        assert!(emptied);
        assert_eq!(proxy.query_usage(dst).unwrap(), cpu_mem);
        assert!(proxy.query_usage(src).is_none());
    }
    assert!(conserved(&monitor, &[src, dst]));
}

#[test]
fn test_regulator_session_lifetime() {
    let regulator = AllocationRegulator::new(limits());
    let initial = regulator.available();

    let job = regulator.register_job();
    assert!(regulator.begin_allocation(job, &mem_gpu0(4 * GIB)));
    assert!(!regulator.begin_allocation(job, &mem_gpu0(12 * GIB)), "beyond remaining capacity");

    regulator.end_allocation(job, &mem_gpu0(1 * GIB));
    regulator.finish_job(job);
    assert_eq!(regulator.available(), initial);

    // finish before end is tolerated; the late end is a no-op.
    let job2 = regulator.register_job();
    assert!(regulator.begin_allocation(job2, &mem_gpu0(1 * GIB)));
    regulator.finish_job(job2);
    regulator.end_allocation(job2, &mem_gpu0(1 * GIB));
    assert_eq!(regulator.available(), initial);
}
