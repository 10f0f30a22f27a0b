//! Two-tier descriptor allocation.
//!
//! CPU staging heaps hold every view the engine creates for live resources;
//! they are bookkept with a bump cursor plus a LIFO free list and guarded by
//! one device-wide lock. Shader-visible heaps are pooled per kind and
//! acquired whole by a command buffer for the duration of one recording;
//! nothing writes into a shader-visible heap except the owning command
//! buffer's thread.

use std::sync::{Arc, Mutex};

use log::error;

use super::native::heap::{DescriptorHeapKind, RawDescriptor, RawDescriptorHeap};
use super::native::RawDevice;

/// Staging heap capacities, sized so exhaustion is a capacity-planning bug.
pub(crate) const STAGING_HEAP_CAPACITY: u32 = 1_000_000;
/// Shader-visible heap capacities per kind.
pub(crate) const GPU_VIEW_HEAP_CAPACITY: u32 = 65_536;
pub(crate) const GPU_SAMPLER_HEAP_CAPACITY: u32 = 2_048;

/// Slot index marking a descriptor that failed to allocate.
const INVALID_INDEX: u32 = u32::MAX;

/// A slot in a CPU staging heap. Holds the owning heap and the slot index;
/// an invalid descriptor has no heap. Never copied while it lives in the
/// heap; release invalidates it.
#[derive(Debug, Default)]
pub(crate) struct CpuDescriptor {
    heap: Option<Arc<RawDescriptorHeap>>,
    index: u32,
}

impl CpuDescriptor {
    pub(crate) fn is_valid(&self) -> bool {
        self.heap.is_some() && self.index != INVALID_INDEX
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Writes the raw view into the staging slot.
    pub(crate) fn write(&self, descriptor: RawDescriptor) {
        if let Some(heap) = &self.heap {
            heap.write(self.index, descriptor);
        }
    }

    pub(crate) fn heap(&self) -> Option<&Arc<RawDescriptorHeap>> {
        self.heap.as_ref()
    }
}

/// Engine bookkeeping over one CPU staging heap.
#[derive(Debug)]
pub(crate) struct StagingHeap {
    raw: Arc<RawDescriptorHeap>,
    max_descriptors: u32,
    current_index: u32,
    inactive_indices: Vec<u32>,
}

impl StagingHeap {
    pub(crate) fn new(device: &RawDevice, kind: DescriptorHeapKind, capacity: u32) -> Self {
        Self {
            raw: RawDescriptorHeap::new(device, kind, capacity, false),
            max_descriptors: capacity,
            current_index: 0,
            inactive_indices: Vec::new(),
        }
    }

    /// Prefers the free list (LIFO, for locality), falls back to the bump
    /// cursor, and fails loudly when both are exhausted. Callers must check
    /// validity of the returned descriptor.
    pub(crate) fn allocate(&mut self) -> CpuDescriptor {
        let index = if let Some(index) = self.inactive_indices.pop() {
            index
        } else if self.current_index < self.max_descriptors {
            let index = self.current_index;
            self.current_index += 1;
            index
        } else {
            error!(
                "out of {:?} staging descriptors ({} allocated)",
                self.raw.kind, self.max_descriptors
            );
            return CpuDescriptor { heap: None, index: INVALID_INDEX };
        };
        CpuDescriptor { heap: Some(Arc::clone(&self.raw)), index }
    }

    /// Returns the slot to the free list and invalidates the descriptor.
    /// Double-release is forbidden; releasing an invalid descriptor is a
    /// no-op so teardown paths stay simple.
    pub(crate) fn release(&mut self, descriptor: &mut CpuDescriptor) {
        if !descriptor.is_valid() {
            return;
        }
        debug_assert!(
            descriptor
                .heap
                .as_ref()
                .is_some_and(|heap| Arc::ptr_eq(heap, &self.raw)),
            "descriptor released to a foreign heap"
        );
        self.raw.write(descriptor.index, RawDescriptor::Empty);
        self.inactive_indices.push(descriptor.index);
        descriptor.heap = None;
        descriptor.index = INVALID_INDEX;
    }

    #[allow(dead_code)]
    pub(crate) fn free_list_len(&self) -> usize {
        self.inactive_indices.len()
    }

    #[allow(dead_code)]
    pub(crate) fn live_count(&self) -> usize {
        self.current_index as usize - self.inactive_indices.len()
    }
}

/// The four staging heaps, guarded together by `staging_lock` on the device.
#[derive(Debug)]
pub(crate) struct StagingHeaps {
    pub(crate) view: StagingHeap,
    pub(crate) sampler: StagingHeap,
    pub(crate) render_target: StagingHeap,
    pub(crate) depth_stencil: StagingHeap,
}

impl StagingHeaps {
    pub(crate) fn new(device: &RawDevice) -> Self {
        Self {
            view: StagingHeap::new(device, DescriptorHeapKind::View, STAGING_HEAP_CAPACITY),
            sampler: StagingHeap::new(device, DescriptorHeapKind::Sampler, STAGING_HEAP_CAPACITY),
            render_target: StagingHeap::new(
                device,
                DescriptorHeapKind::RenderTarget,
                STAGING_HEAP_CAPACITY,
            ),
            depth_stencil: StagingHeap::new(
                device,
                DescriptorHeapKind::DepthStencil,
                STAGING_HEAP_CAPACITY,
            ),
        }
    }
}

/// A shader-visible heap with its write cursor. Lives in a per-kind pool
/// while unowned; the cursor resets on acquisition.
#[derive(Debug)]
pub(crate) struct GpuDescriptorHeap {
    raw: Arc<RawDescriptorHeap>,
    capacity: u32,
    current_index: u32,
}

impl GpuDescriptorHeap {
    fn new(device: &RawDevice, kind: DescriptorHeapKind, capacity: u32) -> Self {
        Self {
            raw: RawDescriptorHeap::new(device, kind, capacity, true),
            capacity,
            current_index: 0,
        }
    }

    /// Reserves `count` contiguous slots at the cursor.
    pub(crate) fn reserve(&mut self, count: u32) -> Option<u32> {
        if self.current_index + count > self.capacity {
            error!(
                "shader-visible {:?} heap exhausted ({} slots)",
                self.raw.kind, self.capacity
            );
            return None;
        }
        let base = self.current_index;
        self.current_index += count;
        Some(base)
    }

    pub(crate) fn raw(&self) -> &Arc<RawDescriptorHeap> {
        &self.raw
    }
}

/// Per-kind pool of shader-visible heaps. Returned heaps are safe to reuse
/// because their command buffer has retired by the time they come back.
#[derive(Debug)]
pub(crate) struct GpuHeapPool {
    kind: DescriptorHeapKind,
    capacity: u32,
    pool: Mutex<Vec<GpuDescriptorHeap>>,
}

impl GpuHeapPool {
    pub(crate) fn new(kind: DescriptorHeapKind, capacity: u32) -> Self {
        Self { kind, capacity, pool: Mutex::new(Vec::new()) }
    }

    pub(crate) fn acquire(&self, device: &RawDevice) -> GpuDescriptorHeap {
        let mut heap = self
            .pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| GpuDescriptorHeap::new(device, self.kind, self.capacity));
        heap.current_index = 0;
        heap
    }

    pub(crate) fn put_back(&self, heap: GpuDescriptorHeap) {
        self.pool.lock().unwrap().push(heap);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> StagingHeap {
        let device = RawDevice::new(false, 0);
        StagingHeap::new(&device, DescriptorHeapKind::View, 4)
    }

    #[test]
    fn slots_are_reused_lifo() {
        let mut heap = heap();
        let mut a = heap.allocate();
        let mut b = heap.allocate();
        let c = heap.allocate();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        heap.release(&mut a);
        heap.release(&mut b);
        // Most recently released comes back first.
        assert_eq!(heap.allocate().index(), 1);
        assert_eq!(heap.allocate().index(), 0);
        // The cursor continues past the recycled range.
        assert_eq!(heap.allocate().index(), 3);
    }

    #[test]
    fn release_invalidates_and_tolerates_double_release() {
        let mut heap = heap();
        let mut a = heap.allocate();
        assert!(a.is_valid());
        heap.release(&mut a);
        assert!(!a.is_valid());
        heap.release(&mut a);
        assert_eq!(heap.free_list_len(), 1);
    }

    #[test]
    fn exhaustion_returns_an_invalid_descriptor() {
        let mut heap = heap();
        let live: Vec<_> = (0..4).map(|_| heap.allocate()).collect();
        assert!(live.iter().all(CpuDescriptor::is_valid));
        let overflow = heap.allocate();
        assert!(!overflow.is_valid());
    }

    #[test]
    fn live_count_tracks_only_unreleased_slots() {
        let mut heap = heap();
        let mut descriptors: Vec<_> = (0..3).map(|_| heap.allocate()).collect();
        heap.release(&mut descriptors[1]);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.free_list_len(), 1);
    }

    #[test]
    fn gpu_pool_reuses_the_last_returned_heap() {
        let device = RawDevice::new(false, 0);
        let pool = GpuHeapPool::new(DescriptorHeapKind::View, 64);
        let mut heap = pool.acquire(&device);
        assert_eq!(heap.reserve(10), Some(0));
        assert_eq!(heap.reserve(10), Some(10));
        let id = heap.raw().id;
        pool.put_back(heap);
        let heap = pool.acquire(&device);
        // Same native heap, cursor reset.
        assert_eq!(heap.raw().id, id);
        assert_eq!(heap.current_index, 0);
    }

    #[test]
    fn gpu_heap_reservation_fails_past_capacity() {
        let device = RawDevice::new(false, 0);
        let pool = GpuHeapPool::new(DescriptorHeapKind::Sampler, 8);
        let mut heap = pool.acquire(&device);
        assert_eq!(heap.reserve(8), Some(0));
        assert_eq!(heap.reserve(1), None);
    }
}
