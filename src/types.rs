//! Shared descriptor/enum types exposed at the crate boundary (spec §6).
//!
//! Mirrors the builder-struct idiom of the teacher's `vulkan/types.rs`
//! (small plain structs with a `new`/fluent-setter pattern), adapted to the
//! value types spec.md §6 names.

use std::time::Duration;

/// A logical device queue identifier. Multiple logical queues of the same
/// `kind` may map onto the same underlying Vulkan queue (spec §4.10); which
/// one is resolved by `device::queue::QueueMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceQueue {
    pub kind: QueueKind,
    pub index: u32,
}

impl DeviceQueue {
    pub fn new(kind: QueueKind, index: u32) -> Self {
        Self { kind, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
    External,
}

/// Policy for how much larger than a request a new backing allocation
/// should be (spec §6): `max(floor(size * request_factor), floor(pool_size
/// * grow_factor), min_allocation_size)`.
#[derive(Debug, Clone, Copy)]
pub struct OverallocationBehavior {
    pub request_factor: f32,
    pub grow_factor: f32,
    pub min_allocation_size: u64,
}

impl OverallocationBehavior {
    pub const fn new(request_factor: f32, grow_factor: f32, min_allocation_size: u64) -> Self {
        Self {
            request_factor,
            grow_factor,
            min_allocation_size,
        }
    }

    /// No overallocation: backing allocations are sized exactly to the request.
    pub const fn none() -> Self {
        Self::new(1.0, 0.0, 0)
    }

    /// A reasonable default progression: 1.5x the immediate request, or 1.25x
    /// the pool's current size, whichever is larger, floored at 64 KiB.
    pub const fn default_growth() -> Self {
        Self::new(1.5, 1.25, 64 * 1024)
    }

    pub fn apply(&self, requested_size: u64, current_pool_size: u64) -> u64 {
        let by_request = (requested_size as f64 * self.request_factor as f64).floor() as u64;
        let by_pool = (current_pool_size as f64 * self.grow_factor as f64).floor() as u64;
        by_request.max(by_pool).max(self.min_allocation_size)
    }
}

impl Default for OverallocationBehavior {
    fn default() -> Self {
        Self::default_growth()
    }
}

/// One entry in a `MemoryPreference` progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    DeviceLocal,
    DeviceLocalHostVisible,
    DeviceLocalHostCached,
    HostVisible,
    HostCached,
}

/// An ordered progression of memory locations to try, plus whether the
/// resulting allocation should stay persistently mapped (spec §6).
#[derive(Debug, Clone)]
pub struct MemoryPreference {
    pub location_progression: Vec<MemoryLocation>,
    pub persistent_map: bool,
}

impl MemoryPreference {
    pub fn new(location_progression: Vec<MemoryLocation>, persistent_map: bool) -> Self {
        assert!(
            location_progression.len() <= 5,
            "memory preference progression is capped at 5 entries"
        );
        Self {
            location_progression,
            persistent_map,
        }
    }

    pub fn device() -> Self {
        use MemoryLocation::*;
        Self::new(
            vec![DeviceLocal, DeviceLocalHostVisible, DeviceLocalHostCached],
            false,
        )
    }

    pub fn host() -> Self {
        use MemoryLocation::*;
        Self::new(
            vec![
                HostCached,
                HostVisible,
                DeviceLocalHostCached,
                DeviceLocalHostVisible,
            ],
            true,
        )
    }

    pub fn upload_stream() -> Self {
        use MemoryLocation::*;
        Self::new(
            vec![
                DeviceLocalHostVisible,
                DeviceLocalHostCached,
                HostVisible,
                HostCached,
            ],
            true,
        )
    }

    pub fn readback_stream() -> Self {
        use MemoryLocation::*;
        Self::new(
            vec![
                DeviceLocalHostCached,
                HostCached,
                DeviceLocalHostVisible,
                HostVisible,
            ],
            true,
        )
    }

    /// A hashable key identifying this progression for use in keyed pools
    /// (C4). Two preferences with the same progression and map-persistence
    /// compare equal.
    pub fn key(&self) -> MemoryPreferenceKey {
        MemoryPreferenceKey {
            progression: self.location_progression.clone(),
            persistent_map: self.persistent_map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryPreferenceKey {
    progression: Vec<MemoryLocation>,
    persistent_map: bool,
}

/// A bounded or unbounded wait duration, stored as nanoseconds internally
/// with `indefinite` as a sentinel maximum (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(u64);

impl Timeout {
    pub const INDEFINITE_NANOS: u64 = u64::MAX;

    pub const fn indefinite() -> Self {
        Self(Self::INDEFINITE_NANOS)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn seconds(seconds: f64) -> Self {
        Self(((seconds * 1_000_000_000.0).max(0.0)) as u64)
    }

    pub fn milliseconds(milliseconds: f64) -> Self {
        Self(((milliseconds * 1_000_000.0).max(0.0)) as u64)
    }

    pub fn is_indefinite(&self) -> bool {
        self.0 == Self::INDEFINITE_NANOS
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_indefinite() {
            None
        } else {
            Some(Duration::from_nanos(self.0))
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::indefinite()
    }
}

/// `(queue, timestamp)` pair waitable across queues (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSemaphore {
    pub queue: DeviceQueue,
    pub timestamp: u64,
}

/// An externally owned semaphore to wait on or signal; `value` is ignored
/// (treated as 0) for binary semaphores.
#[derive(Debug, Clone, Copy)]
pub struct ExternalSemaphore {
    pub handle: ash::vk::Semaphore,
    pub value: u64,
}

impl ExternalSemaphore {
    pub fn binary(handle: ash::vk::Semaphore) -> Self {
        Self { handle, value: 0 }
    }

    pub fn timeline(handle: ash::vk::Semaphore, value: u64) -> Self {
        Self { handle, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Retired,
}
