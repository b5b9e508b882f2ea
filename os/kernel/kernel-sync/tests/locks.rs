use kernel_sync::{IrqGuard, SpinLock, SyncOnceCell, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(41_u32);
    *lock.lock() += 1;
    assert!(!lock.is_locked());
    assert_eq!(*lock.lock(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    for held in [true, false] {
        let spin = SpinLock::new(());
        let ticket = TicketMutex::new(());
        let guards = held.then(|| (spin.lock(), ticket.lock()));
        assert_eq!(spin.try_lock().is_none(), held);
        assert_eq!(ticket.try_lock().is_none(), held);
        drop(guards);
    }
}

#[test]
fn failed_try_lock_leaves_the_holder_alone() {
    let spin = SpinLock::new(0_u32);
    let guard = spin.lock();
    assert!(spin.try_lock().is_none());
    assert!(spin.is_locked());
    assert!(spin.try_lock().is_none());
    drop(guard);
    assert!(!spin.is_locked());
    *spin.lock() += 1;
    assert_eq!(*spin.lock(), 1);

    let ticket = TicketMutex::new(0_u32);
    let guard = ticket.lock();
    assert!(ticket.try_lock().is_none());
    assert!(ticket.is_locked());
    assert!(ticket.try_lock().is_none());
    drop(guard);
    assert!(!ticket.is_locked());
    // the queue is still in step, so neither of these spins
    *ticket.lock() += 1;
    *ticket.try_lock().unwrap() += 1;
    assert_eq!(*ticket.lock(), 2);
}

#[test]
fn irq_guard_releases_the_lock_first() {
    let lock = SpinLock::new(Vec::new());
    {
        let mut guard = lock.lock_irq();
        guard.push(1);
        assert!(lock.is_locked());
    }
    assert!(!lock.is_locked());
    // nested guards on a hosted build are inert
    let _outer = IrqGuard::new();
    let _inner = IrqGuard::new();
    assert_eq!(lock.into_inner(), [1]);
}

fn hammer<L: Send + Sync + 'static>(lock: Arc<L>, add: fn(&L)) -> usize {
    const THREADS: usize = 6;
    const ROUNDS: usize = 2_000;
    let start = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ROUNDS {
                    add(&lock);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    THREADS * ROUNDS
}

#[test]
fn spin_lock_is_exclusive_under_contention() {
    let lock = Arc::new(SpinLock::new(0_usize));
    let expected = hammer(Arc::clone(&lock), |l| *l.lock() += 1);
    assert_eq!(*lock.lock(), expected);
}

#[test]
fn ticket_mutex_is_exclusive_under_contention() {
    let lock = Arc::new(TicketMutex::new(0_usize));
    let expected = hammer(Arc::clone(&lock), |l| {
        let mut guard = l.lock();
        let seen = *guard;
        thread::yield_now();
        *guard = seen + 1;
    });
    assert_eq!(*lock.lock(), expected);
}

#[test]
fn once_cell_keeps_the_first_value() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(1), Ok(()));
    assert_eq!(cell.set(2), Err(2));
    assert_eq!(cell.get(), Some(&1));
}

#[test]
fn once_cell_drops_its_value() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    struct Counted;
    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let cell = SyncOnceCell::new();
    assert!(cell.set(Counted).is_ok());
    // the rejected value is handed back and dropped here
    drop(cell.set(Counted));
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    drop(cell);
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    drop(SyncOnceCell::<Counted>::new());
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
}
