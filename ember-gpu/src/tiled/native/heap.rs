//! Raw descriptor heaps: fixed-capacity slot arrays the engine writes views
//! into. Staging heaps are CPU-only; shader-visible heaps are the ones the
//! GPU reads descriptor tables from during draws and dispatches.

use std::sync::{Arc, Mutex};

use crate::{SamplerCreateInfo, TextureFormat};

use super::resource::{RawBuffer, RawTexture};
use super::RawDevice;

/// The four native descriptor kinds. View heaps hold CBV/SRV/UAV entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorHeapKind {
    View,
    Sampler,
    RenderTarget,
    DepthStencil,
}

/// One slot's contents. `Empty` slots bound to the GPU are a debug-layer
/// error when a draw or dispatch actually references them.
#[derive(Debug, Clone, Default)]
pub(crate) enum RawDescriptor {
    #[default]
    Empty,
    BufferCbv {
        buffer: Arc<RawBuffer>,
    },
    BufferSrv {
        buffer: Arc<RawBuffer>,
    },
    BufferUav {
        buffer: Arc<RawBuffer>,
    },
    TextureSrv {
        texture: Arc<RawTexture>,
        /// `None` covers the whole resource.
        subresource: Option<u32>,
    },
    TextureUav {
        texture: Arc<RawTexture>,
        subresource: u32,
    },
    TextureRtv {
        texture: Arc<RawTexture>,
        subresource: u32,
        format: TextureFormat,
    },
    TextureDsv {
        texture: Arc<RawTexture>,
        subresource: u32,
    },
    Sampler {
        desc: SamplerCreateInfo,
    },
}

/// A raw heap: a slot array plus the shader-visible flag. Occupancy
/// bookkeeping (cursor, free list) lives in the engine's allocator, not here.
#[derive(Debug)]
pub(crate) struct RawDescriptorHeap {
    pub(crate) id: u64,
    pub(crate) kind: DescriptorHeapKind,
    pub(crate) capacity: u32,
    pub(crate) shader_visible: bool,
    slots: Mutex<Vec<RawDescriptor>>,
}

impl RawDescriptorHeap {
    pub(crate) fn new(
        device: &RawDevice,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: device.next_resource_id(),
            kind,
            capacity,
            shader_visible,
            slots: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn write(&self, index: u32, descriptor: RawDescriptor) {
        let mut slots = self.slots.lock().unwrap();
        if index >= self.capacity {
            // Out-of-capacity writes are the engine's bug; drop them.
            return;
        }
        if slots.len() <= index as usize {
            slots.resize_with(index as usize + 1, RawDescriptor::default);
        }
        slots[index as usize] = descriptor;
    }

    pub(crate) fn read(&self, index: u32) -> RawDescriptor {
        let slots = self.slots.lock().unwrap();
        slots.get(index as usize).cloned().unwrap_or_default()
    }

    /// Single-slot descriptor copy, staging heap to shader-visible heap.
    pub(crate) fn copy_from(&self, dst_index: u32, src: &RawDescriptorHeap, src_index: u32) {
        self.write(dst_index, src.read(src_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_between_heaps_moves_slot_contents() {
        let device = RawDevice::new(false, 0);
        let staging = RawDescriptorHeap::new(&device, DescriptorHeapKind::Sampler, 16, false);
        let visible = RawDescriptorHeap::new(&device, DescriptorHeapKind::Sampler, 16, true);
        staging.write(3, RawDescriptor::Sampler { desc: SamplerCreateInfo::default() });
        visible.copy_from(0, &staging, 3);
        assert!(matches!(visible.read(0), RawDescriptor::Sampler { .. }));
        assert!(matches!(visible.read(1), RawDescriptor::Empty));
    }
}
