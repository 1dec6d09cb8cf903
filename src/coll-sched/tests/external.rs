use std::ffi::c_int;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use coll_sched::algo::MAX_CHANNELS;
use coll_sched::param::VarCounts;
use coll_sched::scheduler::{ExternalScheduler, FfiSchedulerParam, SchedulerInterface};
use coll_sched::{CollFunc, CollOp, DataType, DevicePtr, Error, StreamHandle};

mod common;

use common::{algo, comm, write_algo, Harness};

static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static TEARDOWN_CALLS: AtomicUsize = AtomicUsize::new(0);
static ALLTOALLV_HANDLE: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C" fn init() -> c_int {
    INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn select_algo(param: *mut FfiSchedulerParam) -> c_int {
    let param = &mut *param;
    let handle = ALLTOALLV_HANDLE.load(Ordering::SeqCst);
    let is_alltoallv = param.func == CollFunc::AllToAllv as c_int;
    if handle >= 0 && is_alltoallv && !param.recv_counts.is_null() {
        param.scheduled = true;
        param.handle = handle;
    }
    0
}

unsafe extern "C" fn teardown() -> c_int {
    TEARDOWN_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn failing_init() -> c_int {
    3
}

static UNUSED_TEARDOWN_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn quiet_init() -> c_int {
    0
}

unsafe extern "C" fn unused_teardown() -> c_int {
    UNUSED_TEARDOWN_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn external_scheduler_drives_selection() {
    let h = Harness::new();
    let a2av = algo("a2av", CollFunc::AllToAllv, 4);
    let path = write_algo(h.algo_dir(), "alltoallv.toml", &a2av);
    let scheduler = h.scheduler();
    scheduler
        .install_external(ExternalScheduler::from_interface(SchedulerInterface {
            init,
            select_algo,
            teardown,
        }))
        .unwrap();
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);
    assert!(scheduler.uses_external_scheduler());

    let c = comm(1, 2, 4);
    assert_eq!(scheduler.init(&c).unwrap(), MAX_CHANNELS);
    assert_eq!(scheduler.init(&c).unwrap(), MAX_CHANNELS);
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);
    // the external scheduler owns its algorithm set
    assert_eq!(h.parser.parsed.load(Ordering::SeqCst), 0);
    assert_eq!(h.runtime.num_loads(), 0);

    let handle = scheduler.load_algorithm(&path, c.rank).unwrap();
    scheduler.connect_algorithm(handle, &c).unwrap();
    ALLTOALLV_HANDLE.store(handle.0 as i32, Ordering::SeqCst);

    scheduler.group_start().unwrap();
    {
        let counts = vec![3usize, 5, 7, 9];
        let displs = vec![0usize, 3, 8, 15];
        let op = CollOp::all_to_allv(
            DevicePtr(0x1000),
            DevicePtr(0x2000),
            VarCounts::borrowed(&counts, &displs, &counts, &displs),
            DataType::Float32,
        );
        scheduler.enqueue(op, &c, StreamHandle(9)).unwrap();
    }
    scheduler.group_end().unwrap();

    let launches = h.runtime.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].func, CollFunc::AllToAllv);
    assert_eq!(launches[0].recv_counts, Some(vec![3, 5, 7, 9]));
    assert!(h.fallback.calls().is_empty());

    // anything else goes to the plain collectives
    let op = CollOp::all_to_all(DevicePtr(0x1000), DevicePtr(0x2000), 4, DataType::Float32);
    scheduler.enqueue(op, &c, StreamHandle(9)).unwrap();
    assert_eq!(h.fallback.calls().len(), 1);

    scheduler.teardown().unwrap();
    assert_eq!(TEARDOWN_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.unloads.load(Ordering::SeqCst), 1);
    assert!(!scheduler.uses_external_scheduler());
    assert!(!scheduler.is_available());
}

#[test]
fn external_init_failure_is_reported() {
    let h = Harness::new();
    let scheduler = h.scheduler();
    let err = scheduler
        .install_external(ExternalScheduler::from_interface(SchedulerInterface {
            init: failing_init,
            select_algo,
            teardown,
        }))
        .unwrap_err();
    assert!(matches!(err, Error::Plugin { op: "init", code: 3 }));
    assert!(!scheduler.uses_external_scheduler());
}

#[test]
fn load_requires_initialization() {
    let h = Harness::new();
    let path = write_algo(h.algo_dir(), "a.toml", &algo("a", CollFunc::AllReduce, 2));
    let scheduler = h.scheduler();
    assert!(matches!(scheduler.load_algorithm(&path, 0), Err(Error::InvalidUsage(_))));
}

#[test]
fn installed_scheduler_torn_down_without_init() {
    let h = Harness::new();
    let scheduler = h.scheduler();
    scheduler
        .install_external(ExternalScheduler::from_interface(SchedulerInterface {
            init: quiet_init,
            select_algo,
            teardown: unused_teardown,
        }))
        .unwrap();
    assert!(!scheduler.is_available());

    scheduler.teardown().unwrap();
    assert_eq!(UNUSED_TEARDOWN_CALLS.load(Ordering::SeqCst), 1);
    assert!(!scheduler.uses_external_scheduler());
    scheduler.teardown().unwrap();
    assert_eq!(UNUSED_TEARDOWN_CALLS.load(Ordering::SeqCst), 1);
}
