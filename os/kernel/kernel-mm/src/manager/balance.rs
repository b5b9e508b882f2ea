use super::MemoryManager;
use crate::balancer::{BalanceOutcome, BalancerWaiter, ConsumerStatus, MemoryConsumer, TrimCallback};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::sync::atomic::Ordering;
use kernel_sync::context;
use kernel_vmem::PhysMapper;
use log::{debug, info, warn};

impl<M: PhysMapper> MemoryManager<M> {
    /// Install (or with `None`, remove) the trim callback of a consumer.
    pub fn register_consumer(&self, consumer: MemoryConsumer, trim: Option<TrimCallback<M>>) {
        self.consumers.lock()[consumer.index()].trim = trim;
        debug!("consumer {consumer} registered");
    }

    /// Pages the consumer may use before it is trimmed ahead of the others.
    pub fn set_consumer_target(&self, consumer: MemoryConsumer, target: usize) {
        self.consumers.lock()[consumer.index()].target = target;
    }

    #[must_use]
    pub fn consumer_status(&self, consumer: MemoryConsumer) -> ConsumerStatus {
        let (target, trimmable) = {
            let slots = self.consumers.lock();
            let slot = &slots[consumer.index()];
            (slot.target, slot.trim.is_some())
        };
        ConsumerStatus {
            consumer,
            used: self.frames().consumer_used(consumer),
            target,
            trimmable,
        }
    }

    fn outcome(&self, trimmed: usize) -> BalanceOutcome {
        if self.frames().available() >= self.config.low_memory_threshold {
            BalanceOutcome::Satisfied { trimmed }
        } else {
            BalanceOutcome::LowMemory { trimmed }
        }
    }

    /// One synchronous balancing pass.
    ///
    /// While fewer pages than the low-memory threshold are available, the
    /// consumers with a trim callback are asked for the shortfall, furthest
    /// over target first. The pass stops as soon as the threshold is met.
    /// Running out of consumers sets the low-memory condition.
    ///
    /// A caller that finds another pass running waits for it to finish and
    /// reports what it left behind. Only a trim callback re-entering from
    /// the running pass returns at once.
    pub fn balance(&self) -> BalanceOutcome {
        let here = context::current();
        let Some(_pass) = self.balancing.try_lock() else {
            if self.balance_owner.load(Ordering::Acquire) == here {
                return self.outcome(0);
            }
            let seen = self.balance_passes.load(Ordering::Acquire);
            while self.balancing.is_locked() && self.balance_passes.load(Ordering::Acquire) == seen {
                core::hint::spin_loop();
            }
            return self.outcome(0);
        };
        self.balance_owner.store(here, Ordering::Release);
        let outcome = self.balance_pass();
        self.balance_owner.store(context::NO_CONTEXT, Ordering::Release);
        self.balance_passes.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    fn balance_pass(&self) -> BalanceOutcome {
        let threshold = self.config.low_memory_threshold;
        if self.frames().available() >= threshold {
            self.low_memory.store(false, Ordering::Release);
            return BalanceOutcome::Satisfied { trimmed: 0 };
        }

        let registered: Vec<(MemoryConsumer, TrimCallback<M>)> = {
            let slots = self.consumers.lock();
            MemoryConsumer::ALL
                .into_iter()
                .filter_map(|c| slots[c.index()].trim.clone().map(|trim| (c, trim)))
                .collect()
        };
        let mut ranked: Vec<(ConsumerStatus, TrimCallback<M>)> = registered
            .into_iter()
            .map(|(consumer, trim)| (self.consumer_status(consumer), trim))
            .collect();
        ranked.sort_by_key(|(status, _)| Reverse(status.excess()));

        let mut trimmed = 0;
        for (status, trim) in ranked {
            let available = self.frames().available();
            if available >= threshold {
                break;
            }
            let missing = (threshold - available).min(self.config.pages_per_trim);
            let released = trim(self, missing);
            trimmed += released;
            debug!(
                "{}: released {released} of {missing} pages ({} used, target {})",
                status.consumer, status.used, status.target
            );
            if released > 0 {
                self.write_modified_pages(released);
            }
        }

        let outcome = self.outcome(trimmed);
        let low = !outcome.is_satisfied();
        if low {
            warn!(
                "low memory: {} pages available after trimming {trimmed}, threshold {threshold}",
                self.frames().available()
            );
        }
        self.low_memory.store(low, Ordering::Release);
        outcome
    }

    /// One iteration of the background balancer: write modified pages,
    /// balance, then pre-zero free pages.
    pub fn balancer_step(&self) -> BalanceOutcome {
        let batch = self.config.pages_per_trim;
        self.write_modified_pages(batch);
        let outcome = self.balance();
        self.zero_free_pages(batch);
        outcome
    }

    /// Signal the balancer thread, if one is running.
    pub fn wake_balancer(&self) {
        if let Some(waiter) = self.waiter.get() {
            waiter.signal();
        }
    }

    /// Body of the balancer thread.
    pub fn run_balancer_thread(&self, waiter: Arc<dyn BalancerWaiter + Send + Sync>) -> ! {
        if self.waiter.set(Arc::clone(&waiter)).is_err() {
            warn!("balancer thread already registered a waiter");
        }
        info!("balancer thread running");
        loop {
            waiter.wait();
            self.balancer_step();
        }
    }
}
