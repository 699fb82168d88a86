//! Deferred destruction ("lifeguard") mechanism (C9, spec §3, §4.9).
//!
//! The teacher destroys GPU handles per-type, eagerly, once per frame
//! (`Device::cleanup_resources` draining `ResourceHub`'s four `Vec<Pending*>`
//! fields, `vulkan/device.rs`). That works because the teacher has a fixed
//! two-frames-in-flight model. This spec's jobs can outlive an arbitrary
//! number of frames and span multiple queues, so destruction must instead be
//! gated on a timeline threshold rather than "next frame": this module
//! generalizes the teacher's per-type `Pending*` + `Drop` idiom into one
//! generic `Lifeguard<H>` plus a single FIFO destructor queue keyed by
//! timestamp, as spec §3/§4.9 require.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::types::DeviceQueue;

/// A boxed destroy callback. Takes the handle by value so it can only run once.
type DestroyFn<H> = Box<dyn FnOnce(H) + Send>;

/// The timestamp an entry must wait for, one per queue it was used on. A
/// resource last used from a single queue has one entry; a resource visible
/// to multiple queues (e.g. via export/import) can require all of them to be
/// reached before destruction.
#[derive(Debug, Clone, Default)]
pub struct LastUse(Vec<(DeviceQueue, u64)>);

impl LastUse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(queue: DeviceQueue, timestamp: u64) -> Self {
        Self(vec![(queue, timestamp)])
    }

    pub fn record(&mut self, queue: DeviceQueue, timestamp: u64) {
        if let Some(entry) = self.0.iter_mut().find(|(q, _)| *q == queue) {
            entry.1 = entry.1.max(timestamp);
        } else {
            self.0.push((queue, timestamp));
        }
    }

    pub fn is_reached(&self, last_reached: impl Fn(DeviceQueue) -> u64) -> bool {
        self.0.iter().all(|&(q, ts)| last_reached(q) >= ts)
    }

    pub fn entries(&self) -> &[(DeviceQueue, u64)] {
        &self.0
    }
}

struct PendingDestruction<H> {
    handle: H,
    destroy: DestroyFn<H>,
    last_use: LastUse,
}

/// FIFO queue of `(handle, destroy_fn, timestamp)` triples (spec §3).
/// Entries are drained strictly in FIFO order, never out of order, even if
/// a later entry's threshold is reached first — matching spec invariant:
/// "entries are drained in FIFO order; when draining, timestamp <=
/// last_reached_on_all_queues".
pub struct DeferredDestructionQueue<H> {
    entries: Mutex<VecDeque<PendingDestruction<H>>>,
}

impl<H> DeferredDestructionQueue<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, handle: H, last_use: LastUse, destroy: DestroyFn<H>) {
        self.entries.lock().push_back(PendingDestruction {
            handle,
            destroy,
            last_use,
        });
    }

    /// Drains entries from the front of the queue while their threshold is
    /// reached, stopping at the first entry that isn't. This preserves FIFO
    /// semantics: a later-queued, already-ready entry is never destroyed
    /// ahead of an earlier one that is still pending.
    pub fn drain_ready(&self, last_reached: impl Fn(DeviceQueue) -> u64 + Copy) {
        let mut entries = self.entries.lock();
        while let Some(front) = entries.front() {
            if front.last_use.is_reached(last_reached) {
                let entry = entries.pop_front().unwrap();
                (entry.destroy)(entry.handle);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> Default for DeferredDestructionQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for DeferredDestructionQueue<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredDestructionQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueKind;
    use std::sync::Arc;

    fn queue() -> DeviceQueue {
        DeviceQueue::new(QueueKind::Graphics, 0)
    }

    // S5: register L1 at t=5, L2 at t=7. Advance to 6: L1 runs, L2 doesn't.
    // Advance to 7: L2 runs.
    #[test]
    fn drains_in_fifo_order_gated_by_threshold() {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let q = DeferredDestructionQueue::<u32>::new();

        let d1 = destroyed.clone();
        q.push(
            1,
            LastUse::single(queue(), 5),
            Box::new(move |h| d1.lock().push(h)),
        );
        let d2 = destroyed.clone();
        q.push(
            2,
            LastUse::single(queue(), 7),
            Box::new(move |h| d2.lock().push(h)),
        );

        q.drain_ready(|_| 6);
        assert_eq!(*destroyed.lock(), vec![1]);

        q.drain_ready(|_| 7);
        assert_eq!(*destroyed.lock(), vec![1, 2]);
    }

    #[test]
    fn later_ready_entry_waits_behind_earlier_unready_one() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let q = DeferredDestructionQueue::<u32>::new();

        // Entry 1 needs t=10 (not reached yet); entry 2 only needs t=1 but
        // was queued after entry 1, so FIFO order keeps it waiting.
        let o1 = order.clone();
        q.push(1, LastUse::single(queue(), 10), Box::new(move |h| o1.lock().push(h)));
        let o2 = order.clone();
        q.push(2, LastUse::single(queue(), 1), Box::new(move |h| o2.lock().push(h)));

        q.drain_ready(|_| 5);
        assert!(order.lock().is_empty());

        q.drain_ready(|_| 10);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn multi_queue_last_use_requires_all_reached() {
        let q1 = DeviceQueue::new(QueueKind::Graphics, 0);
        let q2 = DeviceQueue::new(QueueKind::Transfer, 0);
        let mut last_use = LastUse::new();
        last_use.record(q1, 3);
        last_use.record(q2, 4);

        assert!(!last_use.is_reached(|q| if q == q1 { 3 } else { 0 }));
        assert!(last_use.is_reached(|q| if q == q1 { 3 } else { 4 }));
    }
}
