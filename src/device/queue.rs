//! Queue submission and physical-queue mutex sharing (C10, spec §4.10).
//!
//! The teacher's `Queue::submit_command_buffers` (`vulkan/lib.rs`) builds a
//! `VkSubmitInfo2` out of `QueueSubmitSemaphoreDescriptor`s and calls
//! `queue_submit2` directly on one dedicated queue. This module keeps that
//! submission shape but adds the piece the teacher never needed: several
//! logical `DeviceQueue`s can alias the same `VkQueue` handle, and the spec
//! requires submissions against aliased handles to be externally
//! synchronized one at a time. The assignment algorithm (round-robin a
//! queue type's requested queues across its family's available Vulkan
//! queues, then group logical queues that landed on the same raw handle
//! under one mutex) is grounded on `queue_map.cpp`'s `QueueMap` constructor
//! and `assignVkQueueHandles`.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{DeviceQueue, QueueKind};

/// One wait or signal entry in a submission. Binary semaphores ignore `value`.
pub struct SemaphoreSubmitDescriptor {
    pub semaphore: vk::Semaphore,
    pub stage_mask: vk::PipelineStageFlags2,
    pub value: u64,
}

impl SemaphoreSubmitDescriptor {
    pub fn binary(semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            stage_mask,
            value: 0,
        }
    }

    pub fn timeline(semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2, value: u64) -> Self {
        Self {
            semaphore,
            stage_mask,
            value,
        }
    }
}

/// Raw family/queue-index coordinates for a resolved logical queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueAssignment {
    pub queue_family_index: u32,
    pub queue_index_in_family: u32,
}

/// Maps each requested logical `DeviceQueue` onto a physical-queue-family
/// slot, round-robining over the family's available queues when more
/// logical queues of a kind are requested than the family has
/// (`queue_map.cpp`'s wraparound). Queues that land on the same raw family
/// slot end up mapped to the same `VkQueue` handle once created, and must
/// therefore share a submission mutex.
pub struct QueueMap {
    assignments: HashMap<DeviceQueue, QueueAssignment>,
}

impl QueueMap {
    /// `family_queue_counts` gives, for each queue family index present in
    /// `requested`, the number of Vulkan queues actually available in that
    /// family.
    pub fn new(
        requested: &[(DeviceQueue, u32 /* queue_family_index */)],
        family_queue_counts: &HashMap<u32, u32>,
    ) -> Self {
        let mut per_family_cursor: HashMap<u32, u32> = HashMap::new();
        let mut assignments = HashMap::new();

        for &(queue, family_index) in requested {
            let available = *family_queue_counts.get(&family_index).unwrap_or(&1);
            let cursor = per_family_cursor.entry(family_index).or_insert(0);
            let queue_index_in_family = *cursor % available.max(1);
            *cursor += 1;

            assignments.insert(
                queue,
                QueueAssignment {
                    queue_family_index: family_index,
                    queue_index_in_family,
                },
            );
        }

        Self { assignments }
    }

    pub fn assignment_of(&self, queue: DeviceQueue) -> Option<QueueAssignment> {
        self.assignments.get(&queue).copied()
    }

    pub fn assignments(&self) -> impl Iterator<Item = (DeviceQueue, QueueAssignment)> + '_ {
        self.assignments.iter().map(|(&q, &a)| (q, a))
    }
}

/// A single physical `VkQueue`, guarded by a mutex shared by every logical
/// `DeviceQueue` that resolved to it (`queue_map.cpp`'s `physicalQueueMutexes`
/// grouping by raw handle equality).
struct PhysicalQueue {
    raw: vk::Queue,
    submit_lock: Mutex<()>,
}

/// Owns the physical queues and the logical→physical routing table, and
/// performs synchronized `vkQueueSubmit2` calls on behalf of logical queues
/// (spec §5: `DeviceQueue` submission is not internally synchronized by the
/// facade *except* where multiple logical queues share one physical handle,
/// in which case submissions against that handle are serialized here).
pub struct Queues {
    device: ash::Device,
    physical: Vec<Arc<PhysicalQueue>>,
    routing: HashMap<DeviceQueue, usize>,
}

impl Queues {
    /// `handles` must list, in the same order as `logical_queues`, the raw
    /// `VkQueue` resolved for each. Queues sharing a raw handle are grouped
    /// under one `PhysicalQueue`/mutex.
    pub fn new(
        device: ash::Device,
        logical_queues: &[DeviceQueue],
        handles: &[vk::Queue],
    ) -> Self {
        let (physical, routing) = group_by_raw_handle(logical_queues, handles);
        Self {
            device,
            physical,
            routing,
        }
    }

    pub fn queue_kind_exists(&self, queue: DeviceQueue) -> bool {
        self.routing.contains_key(&queue)
    }

    /// Returns the raw `VkQueue` handle a logical queue resolved to, for
    /// operations this module doesn't itself wrap (e.g. `vkQueuePresentKHR`).
    pub fn raw_handle(&self, queue: DeviceQueue) -> vk::Queue {
        let physical_index = *self.routing.get(&queue).expect("raw_handle on an unmapped DeviceQueue");
        self.physical[physical_index].raw
    }

    /// Submits `command_buffers` on `queue`, waiting on `waits` and signaling
    /// `signals`. Serializes against every other logical queue sharing the
    /// same raw `VkQueue` handle.
    pub fn submit(
        &self,
        queue: DeviceQueue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[SemaphoreSubmitDescriptor],
        signals: &[SemaphoreSubmitDescriptor],
    ) -> Result<()> {
        let physical_index = *self
            .routing
            .get(&queue)
            .expect("submission on an unmapped DeviceQueue");
        let physical = &self.physical[physical_index];

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = waits
            .iter()
            .map(|w| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(w.semaphore)
                    .stage_mask(w.stage_mask)
                    .value(w.value)
            })
            .collect();
        let signal_infos: Vec<vk::SemaphoreSubmitInfo> = signals
            .iter()
            .map(|s| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(s.semaphore)
                    .stage_mask(s.stage_mask)
                    .value(s.value)
            })
            .collect();
        let command_buffer_infos: Vec<vk::CommandBufferSubmitInfo> = command_buffers
            .iter()
            .map(|&cb| vk::CommandBufferSubmitInfo::default().command_buffer(cb))
            .collect();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&command_buffer_infos);

        let _guard = physical.submit_lock.lock();
        unsafe {
            self.device
                .queue_submit2(physical.raw, std::slice::from_ref(&submit_info), vk::Fence::null())?;
        }
        Ok(())
    }

    /// Locks every physical queue's submission mutex in a fixed order
    /// (iteration order over `self.physical`, stable for the lifetime of
    /// this `Queues`), used before `vkDeviceWaitIdle`-style operations.
    /// Locking in one consistent order across all call sites avoids
    /// deadlock even though individual submissions only ever take one lock
    /// at a time (`queue_map.cpp`'s `lockPhysicalQueues`).
    pub fn lock_all_physical_queues(&self) -> Vec<parking_lot::MutexGuard<'_, ()>> {
        self.physical.iter().map(|p| p.submit_lock.lock()).collect()
    }
}

/// Groups `logical_queues` by the raw `VkQueue` handle each resolved to,
/// assigning every queue that shares a handle the same physical-queue
/// index (`queue_map.cpp`'s handle-equality grouping). Split out of
/// [`Queues::new`] so the grouping itself is testable without a real
/// `ash::Device`.
fn group_by_raw_handle(
    logical_queues: &[DeviceQueue],
    handles: &[vk::Queue],
) -> (Vec<Arc<PhysicalQueue>>, HashMap<DeviceQueue, usize>) {
    assert_eq!(logical_queues.len(), handles.len());

    let mut physical: Vec<Arc<PhysicalQueue>> = Vec::new();
    let mut routing = HashMap::new();

    for (&queue, &raw) in logical_queues.iter().zip(handles) {
        let physical_index = physical.iter().position(|p| p.raw == raw).unwrap_or_else(|| {
            physical.push(Arc::new(PhysicalQueue {
                raw,
                submit_lock: Mutex::new(()),
            }));
            physical.len() - 1
        });
        routing.insert(queue, physical_index);
    }

    (physical, routing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(kind: QueueKind, index: u32) -> DeviceQueue {
        DeviceQueue::new(kind, index)
    }

    #[test]
    fn round_robins_over_available_family_queues() {
        let requested = vec![
            (q(QueueKind::Graphics, 0), 0u32),
            (q(QueueKind::Compute, 0), 0u32),
            (q(QueueKind::Compute, 1), 0u32),
        ];
        let mut counts = HashMap::new();
        counts.insert(0u32, 2u32); // family 0 has only 2 physical queues

        let map = QueueMap::new(&requested, &counts);
        let a0 = map.assignment_of(q(QueueKind::Graphics, 0)).unwrap();
        let a1 = map.assignment_of(q(QueueKind::Compute, 0)).unwrap();
        let a2 = map.assignment_of(q(QueueKind::Compute, 1)).unwrap();

        assert_eq!(a0.queue_index_in_family, 0);
        assert_eq!(a1.queue_index_in_family, 1);
        // Third request wraps back around to slot 0, aliasing with a0.
        assert_eq!(a2.queue_index_in_family, 0);
    }

    #[test]
    fn queues_sharing_a_raw_handle_share_one_physical_queue_slot() {
        let raw_handle = vk::Queue::null();
        let logical = vec![q(QueueKind::Graphics, 0), q(QueueKind::Compute, 0)];
        let handles = vec![raw_handle, raw_handle];

        let (physical, routing) = group_by_raw_handle(&logical, &handles);

        assert_eq!(physical.len(), 1);
        assert!(routing.contains_key(&q(QueueKind::Graphics, 0)));
        assert!(routing.contains_key(&q(QueueKind::Compute, 0)));
        assert_eq!(routing[&q(QueueKind::Graphics, 0)], routing[&q(QueueKind::Compute, 0)]);
    }
}
