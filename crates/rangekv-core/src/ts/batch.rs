//! Lock-free batched timestamp storage.
//!
//! [`BatchTsList`] is a pair of Michael–Scott queues over heap nodes: a live
//! queue the consumers pop timestamps from, and a dead queue holding retired
//! nodes for deferred reclamation. Retired nodes are freed only after they
//! have sat in the dead queue for `clean_dead_interval_ms`; consumers never
//! hold a node pointer across a blocking call, so the interval bounds their
//! exposure. This mirrors the reclamation contract of the TSO cache this
//! design comes from.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

use crate::codec::compose_ts;
use crate::types::current_time_ms;

/// A pre-fetched block of timestamps `[start_ts, end_ts)` consumed through an
/// atomic cursor.
pub struct BatchTs {
    physical: i64,
    end_ts: i64,
    cursor: AtomicI64,
    create_time_ms: i64,
    dead_time_ms: AtomicI64,
    next: AtomicPtr<BatchTs>,
}

impl BatchTs {
    /// Allocate a batch covering `count` timestamps from `(physical, logical)`.
    pub fn alloc(physical: i64, logical: i64, count: u32) -> *mut BatchTs {
        let start_ts = compose_ts(physical, logical);
        let end_ts = compose_ts(physical, logical + count as i64);
        Box::into_raw(Box::new(BatchTs {
            physical,
            end_ts,
            cursor: AtomicI64::new(start_ts),
            create_time_ms: current_time_ms(),
            dead_time_ms: AtomicI64::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }))
    }

    /// An exhausted sentinel node.
    fn sentinel() -> *mut BatchTs {
        Self::alloc(0, 0, 0)
    }

    /// Pop the next timestamp, or 0 when the batch is exhausted.
    fn get_ts(&self) -> i64 {
        let ts = self.cursor.fetch_add(1, Ordering::AcqRel);
        if ts >= self.end_ts {
            0
        } else {
            ts
        }
    }

    /// Exhaust the batch so no further timestamps are issued from it.
    fn exhaust(&self) {
        self.cursor.store(self.end_ts, Ordering::Release);
    }

    fn physical(&self) -> i64 {
        self.physical
    }
}

/// Live + dead queues of [`BatchTs`] nodes.
///
/// All mutations are CAS loops with help-advance-tail so a preempted producer
/// never wedges the queue.
pub struct BatchTsList {
    head: AtomicPtr<BatchTs>,
    tail: AtomicPtr<BatchTs>,
    dead_head: AtomicPtr<BatchTs>,
    dead_tail: AtomicPtr<BatchTs>,
    active_count: AtomicU64,
    dead_count: AtomicU64,
    /// Newest physical clock observed from the TSO; batches far behind it
    /// are stale even if recently created.
    last_physical: AtomicI64,
    stale_interval_ms: i64,
    clean_dead_interval_ms: i64,
}

unsafe impl Send for BatchTsList {}
unsafe impl Sync for BatchTsList {}

impl BatchTsList {
    pub fn new(stale_interval_ms: i64, clean_dead_interval_ms: i64) -> Self {
        let sentinel = BatchTs::sentinel();
        let dead_sentinel = BatchTs::sentinel();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            dead_head: AtomicPtr::new(dead_sentinel),
            dead_tail: AtomicPtr::new(dead_sentinel),
            active_count: AtomicU64::new(0),
            dead_count: AtomicU64::new(0),
            last_physical: AtomicI64::new(0),
            stale_interval_ms,
            clean_dead_interval_ms,
        }
    }

    /// Enqueue a freshly fetched batch. Takes ownership of the pointer.
    pub fn push(&self, batch: *mut BatchTs) {
        debug_assert!(!batch.is_null());
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: live nodes are only freed via the dead queue after the
            // grace interval, so tail is dereferenceable here.
            let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if !tail_next.is_null() {
                // Help a stalled producer advance the tail.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    tail_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if unsafe {
                (*tail)
                    .next
                    .compare_exchange_weak(
                        std::ptr::null_mut(),
                        batch,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            } {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    batch,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.active_count.fetch_add(1, Ordering::Relaxed);
                let physical = unsafe { (*batch).physical() };
                self.last_physical.fetch_max(physical, Ordering::AcqRel);
                return;
            }
        }
    }

    fn is_stale(&self, batch: &BatchTs) -> bool {
        let now_ms = current_time_ms();
        if batch.create_time_ms + self.stale_interval_ms < now_ms {
            return true;
        }
        batch.physical() + self.stale_interval_ms < self.last_physical.load(Ordering::Acquire)
    }

    /// Pop the next timestamp strictly greater than `after_ts`.
    ///
    /// Stale or exhausted head nodes are retired to the dead queue and the
    /// next node is tried. Returns 0 when no usable batch remains; the caller
    /// triggers a renew and retries. Never blocks.
    pub fn get_ts(&self, after_ts: i64) -> i64 {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: see `push`; the dead-queue grace interval keeps head
            // alive for the duration of this loop iteration.
            let head_next = unsafe { (*head).next.load(Ordering::Acquire) };

            if !self.is_stale(unsafe { &*head }) {
                let ts = unsafe { (*head).get_ts() };
                if ts > 0 && ts > after_ts {
                    return ts;
                }
            }

            if head_next.is_null() {
                return 0;
            }
            if head == tail {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.active_count.fetch_sub(1, Ordering::Relaxed);
                self.push_dead(head);
            }
        }
    }

    fn push_dead(&self, batch: *mut BatchTs) {
        unsafe {
            (*batch).next.store(std::ptr::null_mut(), Ordering::Release);
            (*batch)
                .dead_time_ms
                .store(current_time_ms(), Ordering::Release);
        }
        loop {
            let tail = self.dead_tail.load(Ordering::Acquire);
            let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if tail != self.dead_tail.load(Ordering::Acquire) {
                continue;
            }
            if !tail_next.is_null() {
                let _ = self.dead_tail.compare_exchange_weak(
                    tail,
                    tail_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if unsafe {
                (*tail)
                    .next
                    .compare_exchange_weak(
                        std::ptr::null_mut(),
                        batch,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            } {
                let _ = self.dead_tail.compare_exchange_weak(
                    tail,
                    batch,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.dead_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Free dead nodes that have aged past the grace interval.
    pub fn clean_dead(&self) {
        loop {
            let head = self.dead_head.load(Ordering::Acquire);
            let tail = self.dead_tail.load(Ordering::Acquire);
            let head_next = unsafe { (*head).next.load(Ordering::Acquire) };

            let cutoff = current_time_ms() - self.clean_dead_interval_ms;
            if unsafe { (*head).dead_time_ms.load(Ordering::Acquire) } >= cutoff {
                return;
            }
            if head_next.is_null() {
                return;
            }
            if head == tail {
                let _ = self.dead_tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if self
                .dead_head
                .compare_exchange_weak(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.dead_count.fetch_sub(1, Ordering::Relaxed);
                // Safety: the node left the live queue at least
                // `clean_dead_interval_ms` ago and is unreachable from it.
                unsafe { drop(Box::from_raw(head)) };
            }
        }
    }

    /// Discard every buffered timestamp (used on TSO leadership change).
    /// Exhausted nodes drain through the regular dead-queue path on the next
    /// `get_ts`.
    pub fn flush(&self) {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            unsafe {
                (*node).exhaust();
                node = (*node).next.load(Ordering::Acquire);
            }
        }
    }

    /// Nodes reachable from the live head (includes the sentinel).
    pub fn actual_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            count += 1;
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        count
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn dead_count(&self) -> u64 {
        self.dead_count.load(Ordering::Relaxed)
    }

    pub fn debug_info(&self) -> String {
        format!(
            "actual_count({}) active_count({}) dead_count({}) last_physical({})",
            self.actual_count(),
            self.active_count(),
            self.dead_count(),
            self.last_physical.load(Ordering::Acquire),
        )
    }
}

impl Drop for BatchTsList {
    fn drop(&mut self) {
        for head in [
            self.head.swap(std::ptr::null_mut(), Ordering::AcqRel),
            self.dead_head.swap(std::ptr::null_mut(), Ordering::AcqRel),
        ] {
            let mut node = head;
            while !node.is_null() {
                let next = unsafe { (*node).next.load(Ordering::Acquire) };
                unsafe { drop(Box::from_raw(node)) };
                node = next;
            }
        }
        self.tail.store(std::ptr::null_mut(), Ordering::Release);
        self.dead_tail.store(std::ptr::null_mut(), Ordering::Release);
    }
}
