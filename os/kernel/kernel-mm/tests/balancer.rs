mod common;

use common::{Mm, boot, boot_with, config};
use kernel_mm::pfn::Pfn;
use kernel_mm::{BalanceOutcome, MemoryConsumer, MmConfig, TrimCallback};
use kernel_vmem::sim::SimulatedRam;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

type Calls = Arc<Mutex<Vec<MemoryConsumer>>>;

fn recording(calls: &Calls, consumer: MemoryConsumer) -> TrimCallback<SimulatedRam> {
    let calls = Arc::clone(calls);
    Arc::new(move |_: &Mm, _: usize| {
        calls.lock().unwrap().push(consumer);
        0
    })
}

/// Trim callback handing back frames from `held`, one `free` per page.
fn releasing(calls: &Calls, held: &Arc<Mutex<Vec<Pfn>>>) -> TrimCallback<SimulatedRam> {
    let calls = Arc::clone(calls);
    let held = Arc::clone(held);
    Arc::new(move |mm: &Mm, pages: usize| {
        calls.lock().unwrap().push(MemoryConsumer::Cache);
        let mut held = held.lock().unwrap();
        let mut released = 0;
        while released < pages {
            let Some(pfn) = held.pop() else {
                break;
            };
            mm.free(pfn);
            released += 1;
        }
        released
    })
}

#[test]
fn consumers_furthest_over_target_go_first() {
    let mm = boot_with(
        MmConfig {
            low_memory_threshold: 1_000_000,
            ..config()
        },
        0x1000,
    );
    for _ in 0..5 {
        mm.allocate(MemoryConsumer::Cache).unwrap();
    }
    for _ in 0..2 {
        mm.allocate(MemoryConsumer::User).unwrap();
    }
    let system = mm.consumer_status(MemoryConsumer::System).used;
    mm.set_consumer_target(MemoryConsumer::Cache, 0);
    mm.set_consumer_target(MemoryConsumer::User, 0);
    mm.set_consumer_target(MemoryConsumer::System, system + 10);

    let calls = Calls::default();
    for consumer in [MemoryConsumer::System, MemoryConsumer::User, MemoryConsumer::Cache] {
        mm.register_consumer(consumer, Some(recording(&calls, consumer)));
    }

    assert_eq!(mm.balance(), BalanceOutcome::LowMemory { trimmed: 0 });
    assert_eq!(
        *calls.lock().unwrap(),
        [MemoryConsumer::Cache, MemoryConsumer::User, MemoryConsumer::System]
    );
    assert!(mm.low_memory());
}

#[test]
fn balancing_stops_once_the_threshold_is_met() {
    let mm = boot_with(
        MmConfig {
            low_memory_threshold: 512,
            ..config()
        },
        0x1000,
    );
    let held = Arc::new(Mutex::new(Vec::new()));
    while mm.frame_counts().available() > 509 {
        let pfn = mm.allocate(MemoryConsumer::Cache).unwrap();
        held.lock().unwrap().push(pfn);
    }
    mm.set_consumer_target(MemoryConsumer::Cache, 0);
    mm.set_consumer_target(MemoryConsumer::User, 0);

    let calls = Calls::default();
    mm.register_consumer(MemoryConsumer::Cache, Some(releasing(&calls, &held)));
    mm.register_consumer(MemoryConsumer::User, Some(recording(&calls, MemoryConsumer::User)));

    assert_eq!(mm.balance(), BalanceOutcome::Satisfied { trimmed: 3 });
    assert_eq!(*calls.lock().unwrap(), [MemoryConsumer::Cache]);
    assert_eq!(mm.frame_counts().available(), 512);
    assert!(!mm.low_memory());

    // nothing to do the second time
    assert_eq!(mm.balance(), BalanceOutcome::Satisfied { trimmed: 0 });
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn exhausted_allocation_is_rescued_by_a_trim() {
    let mm = boot_with(
        MmConfig {
            allocation_retries: 1,
            ..config()
        },
        0x800,
    );
    let held = Arc::new(Mutex::new(Vec::new()));
    while let Ok(pfn) = mm.allocate(MemoryConsumer::Cache) {
        held.lock().unwrap().push(pfn);
    }
    assert!(mm.low_memory());

    let calls = Calls::default();
    mm.register_consumer(MemoryConsumer::Cache, Some(releasing(&calls, &held)));
    let pfn = mm.allocate(MemoryConsumer::System).unwrap();
    assert_eq!(calls.lock().unwrap().first(), Some(&MemoryConsumer::Cache));
    assert!(mm.is_page_in_use(pfn));
    mm.free(pfn);
}

#[test]
fn allocation_waits_for_the_running_pass() {
    let mm = boot_with(
        MmConfig {
            allocation_retries: 1,
            ..config()
        },
        0x800,
    );
    let held = Arc::new(Mutex::new(Vec::new()));
    while let Ok(pfn) = mm.allocate(MemoryConsumer::Cache) {
        held.lock().unwrap().push(pfn);
    }

    // The pass holds on to its pages until well after the allocation below
    // has found no free frame.
    let entered = Arc::new(Barrier::new(2));
    let calls = Calls::default();
    let release = releasing(&calls, &held);
    let in_pass = Arc::clone(&entered);
    let slow: TrimCallback<SimulatedRam> = Arc::new(move |mm: &Mm, pages: usize| {
        in_pass.wait();
        thread::sleep(Duration::from_millis(100));
        release(mm, pages)
    });
    mm.register_consumer(MemoryConsumer::Cache, Some(slow));

    let pfn = thread::scope(|scope| {
        let pass = scope.spawn(|| mm.balance());
        entered.wait();
        let pfn = mm.allocate(MemoryConsumer::System);
        assert!(pass.join().unwrap().trimmed() > 0);
        pfn
    })
    .unwrap();
    // only the first pass trimmed anything
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(mm.is_page_in_use(pfn));
    mm.free(pfn);
}

#[test]
fn trim_callback_allocating_does_not_wait_on_itself() {
    let mm = boot_with(
        MmConfig {
            allocation_retries: 2,
            ..config()
        },
        0x800,
    );
    let held = Arc::new(Mutex::new(Vec::new()));
    while let Ok(pfn) = mm.allocate(MemoryConsumer::Cache) {
        held.lock().unwrap().push(pfn);
    }

    let nested = Arc::new(Mutex::new(None));
    let outcome = Arc::clone(&nested);
    let allocating: TrimCallback<SimulatedRam> = Arc::new(move |mm: &Mm, _: usize| {
        *outcome.lock().unwrap() = Some(mm.allocate(MemoryConsumer::System));
        0
    });
    mm.register_consumer(MemoryConsumer::Cache, Some(allocating));
    assert!(!mm.balance().is_satisfied());
    assert_eq!(*nested.lock().unwrap(), Some(Err(kernel_mm::MmError::OutOfMemory)));
}

#[test]
fn consumer_status_reports_excess() {
    let mm = boot(0x1000);
    let user = mm.consumer_status(MemoryConsumer::User);
    assert!(user.trimmable);
    assert!(user.excess() < 0);
    let cache = mm.consumer_status(MemoryConsumer::Cache);
    assert!(!cache.trimmable);
    assert_eq!(cache.used, 0);

    // no target: never ranked ahead of anyone
    let system = mm.consumer_status(MemoryConsumer::System);
    assert_eq!(system.target, usize::MAX);
    assert_eq!(system.excess(), i64::MIN);

    let pfns: Vec<_> = (0..3).map(|_| mm.allocate(MemoryConsumer::Cache).unwrap()).collect();
    mm.set_consumer_target(MemoryConsumer::Cache, 1);
    let cache = mm.consumer_status(MemoryConsumer::Cache);
    assert_eq!(cache.used, 3);
    assert_eq!(cache.excess(), 2);

    mm.register_consumer(MemoryConsumer::User, None);
    assert!(!mm.consumer_status(MemoryConsumer::User).trimmable);
    for pfn in pfns {
        mm.free(pfn);
    }
}

#[test]
fn balancer_step_pre_zeroes_free_pages() {
    let mm = boot_with(
        MmConfig {
            pages_per_trim: 64,
            ..config()
        },
        0x1000,
    );
    let before = mm.frame_counts();
    assert!(mm.balancer_step().is_satisfied());
    let after = mm.frame_counts();
    assert_eq!(after.zeroed, before.zeroed + 64);
    assert_eq!(after.free, before.free - 64);
    assert_eq!(after.available(), before.available());

    // no balancer thread: a wake-up goes nowhere
    mm.wake_balancer();
}
