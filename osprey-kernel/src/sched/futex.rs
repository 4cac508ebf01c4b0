//! Futexes: user-address keyed wait queues.
//!
//! The table maps a user virtual address (its atomic-int identity) to a
//! bucket of waiters. The process-wide table lock is held across the
//! value check and waiter registration, so a concurrent wake cannot
//! slip between the compare and the block: a wake arriving after
//! registration leaves a signal behind that the wait consumes
//! immediately.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use osprey_abi::{SysError, SysResult};
use spinning_top::Spinlock;

use super::event::Event;

struct FutexBucket {
    event: Event,
    waiters: AtomicUsize,
}

pub struct FutexTable {
    buckets: Spinlock<BTreeMap<usize, Arc<FutexBucket>>>,
}

impl FutexTable {
    pub fn new() -> Self {
        Self {
            buckets: Spinlock::new(BTreeMap::new()),
        }
    }

    /// Block until a wake on `addr`, unless `*addr != expected` already.
    /// `timeout_ns == 0` waits forever.
    ///
    /// The caller is in a syscall on the owning process, so its page
    /// map is active and `addr` has been range-checked.
    pub fn wait(&self, addr: usize, expected: u32, timeout_ns: u64) -> SysResult<()> {
        let bucket = {
            let mut buckets = self.buckets.lock();
            let value = crate::syscall::user::read_user_u32(addr)?;
            if value != expected {
                return Err(SysError::TryAgain);
            }
            let bucket = buckets
                .entry(addr)
                .or_insert_with(|| {
                    Arc::new(FutexBucket {
                        event: Event::new(),
                        waiters: AtomicUsize::new(0),
                    })
                })
                .clone();
            bucket.waiters.fetch_add(1, Ordering::SeqCst);
            bucket
        };

        let result = if timeout_ns == 0 {
            bucket.event.wait();
            Ok(())
        } else if bucket.event.wait_with_timeout(timeout_ns / 1_000) {
            Ok(())
        } else {
            Err(SysError::Timeout)
        };

        bucket.waiters.fetch_sub(1, Ordering::SeqCst);
        self.collect(addr);
        result
    }

    /// Wake up to `count` waiters on `addr`. Returns how many were
    /// actually woken.
    pub fn wake(&self, addr: usize, count: usize) -> usize {
        let bucket = {
            let buckets = self.buckets.lock();
            match buckets.get(&addr) {
                Some(bucket) => bucket.clone(),
                None => return 0,
            }
        };
        let woken = bucket.waiters.load(Ordering::SeqCst).min(count);
        if woken > 0 {
            bucket.event.signal_count(woken);
        }
        woken
    }

    /// Drop an idle bucket.
    fn collect(&self, addr: usize) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get(&addr)
            && bucket.waiters.load(Ordering::SeqCst) == 0
            && !bucket.event.is_being_waited()
        {
            buckets.remove(&addr);
        }
    }
}
