//! Raw committed resources: CPU-backed storage plus per sub-resource access
//! states. States are mutated only through transition barriers recorded in a
//! command list; the executor validates the before-state of every barrier.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{SampleCount, TextureFormat, TextureType, TextureUsage};

use super::RawDevice;

/// Access state of a resource or texture sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceState {
    Common,
    /// Fixed state of upload-heap resources; they never transition.
    GenericRead,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    NonPixelShaderResource,
    AllShaderResource,
    IndirectArgument,
    CopyDest,
    CopySource,
    Present,
}

/// Which memory heap a committed resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapKind {
    /// Device-local. Initial state `Common`.
    Default,
    /// Host-visible write-combined, persistently mappable. `GenericRead`.
    Upload,
    /// Host-visible cached, for downloads. `CopyDest`.
    Readback,
}

impl HeapKind {
    pub(crate) fn initial_state(self) -> ResourceState {
        match self {
            HeapKind::Default => ResourceState::Common,
            HeapKind::Upload => ResourceState::GenericRead,
            HeapKind::Readback => ResourceState::CopyDest,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RawBuffer {
    pub(crate) id: u64,
    pub(crate) size: u64,
    pub(crate) heap: HeapKind,
    pub(crate) gpu_address: u64,
    storage: Mutex<Vec<u8>>,
    state: Mutex<ResourceState>,
}

impl RawBuffer {
    pub(crate) fn new(device: &RawDevice, size: u64, heap: HeapKind) -> Arc<Self> {
        Arc::new(Self {
            id: device.next_resource_id(),
            size,
            heap,
            gpu_address: device.allocate_address(size),
            storage: Mutex::new(vec![0u8; size as usize]),
            state: Mutex::new(heap.initial_state()),
        })
    }

    pub(crate) fn storage(&self) -> MutexGuard<'_, Vec<u8>> {
        self.storage.lock().unwrap()
    }

    pub(crate) fn current_state(&self) -> ResourceState {
        *self.state.lock().unwrap()
    }

    /// Applies a transition barrier, reporting a before-state mismatch to the
    /// debug layer. Upload-heap resources reject transitions outright.
    pub(crate) fn transition(
        &self,
        device: &RawDevice,
        before: ResourceState,
        after: ResourceState,
    ) {
        if self.heap == HeapKind::Upload {
            device.validation_error(format!(
                "buffer {} lives in the upload heap and cannot transition",
                self.id
            ));
            return;
        }
        let mut state = self.state.lock().unwrap();
        if *state != before {
            device.validation_error(format!(
                "buffer {} transition expected before-state {:?} but resource is {:?}",
                self.id, before, *state
            ));
        }
        *state = after;
    }
}

/// Everything the executor needs to know about a texture's shape.
#[derive(Debug, Clone)]
pub(crate) struct RawTextureDesc {
    pub(crate) texture_type: TextureType,
    pub(crate) format: TextureFormat,
    pub(crate) usage: TextureUsage,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) layer_count: u32,
    pub(crate) level_count: u32,
    pub(crate) sample_count: SampleCount,
}

impl RawTextureDesc {
    pub(crate) fn subresource_count(&self) -> u32 {
        self.layer_count * self.level_count
    }

    pub(crate) fn level_width(&self, level: u32) -> u32 {
        (self.width >> level).max(1)
    }

    pub(crate) fn level_height(&self, level: u32) -> u32 {
        (self.height >> level).max(1)
    }

    pub(crate) fn level_depth(&self, level: u32) -> u32 {
        (self.depth >> level).max(1)
    }

    /// Tightly packed bytes per row for one level.
    pub(crate) fn level_row_pitch(&self, level: u32) -> u32 {
        let blocks = self.level_width(level).div_ceil(self.format.block_dimension());
        blocks * self.format.texel_block_size()
    }

    pub(crate) fn level_row_count(&self, level: u32) -> u32 {
        self.level_height(level).div_ceil(self.format.block_dimension())
    }

    pub(crate) fn subresource_size(&self, level: u32) -> usize {
        self.level_row_pitch(level) as usize
            * self.level_row_count(level) as usize
            * self.level_depth(level) as usize
    }
}

#[derive(Debug)]
pub(crate) struct RawTexture {
    pub(crate) id: u64,
    pub(crate) desc: RawTextureDesc,
    /// One tightly packed slab per sub-resource (`layer * levels + level`).
    slabs: Vec<Mutex<Vec<u8>>>,
    states: Mutex<Vec<ResourceState>>,
}

impl RawTexture {
    pub(crate) fn new(
        device: &RawDevice,
        desc: RawTextureDesc,
        initial_state: ResourceState,
    ) -> Arc<Self> {
        let mut slabs = Vec::with_capacity(desc.subresource_count() as usize);
        for sub in 0..desc.subresource_count() {
            let level = sub % desc.level_count;
            slabs.push(Mutex::new(vec![0u8; desc.subresource_size(level)]));
        }
        let states = vec![initial_state; desc.subresource_count() as usize];
        Arc::new(Self {
            id: device.next_resource_id(),
            desc,
            slabs,
            states: Mutex::new(states),
        })
    }

    pub(crate) fn slab(&self, subresource: u32) -> MutexGuard<'_, Vec<u8>> {
        self.slabs[subresource as usize].lock().unwrap()
    }

    pub(crate) fn subresource_state(&self, subresource: u32) -> ResourceState {
        self.states.lock().unwrap()[subresource as usize]
    }

    pub(crate) fn transition(
        &self,
        device: &RawDevice,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    ) {
        let mut states = self.states.lock().unwrap();
        let current = &mut states[subresource as usize];
        if *current != before {
            device.validation_error(format!(
                "texture {} sub-resource {} transition expected before-state {:?} but is {:?}",
                self.id, subresource, before, *current
            ));
        }
        *current = after;
    }

    /// Used by the swapchain manager when a back-buffer ring is rebuilt.
    pub(crate) fn force_state(&self, state: ResourceState) {
        for slot in self.states.lock().unwrap().iter_mut() {
            *slot = state;
        }
    }
}

fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;
    if exp == 0xff {
        // Inf/NaN
        return sign | 0x7c00 | if mantissa != 0 { 0x200 } else { 0 };
    }
    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7c00;
    }
    if unbiased < -24 {
        return sign;
    }
    if unbiased < -14 {
        let shift = -unbiased - 14;
        let significand = (mantissa | 0x80_0000) >> (13 + shift);
        return sign | significand as u16;
    }
    sign | (((unbiased + 15) as u16) << 10) | (mantissa >> 13) as u16
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Encodes a clear color into one texel of `format`. Block-compressed
/// formats cannot be cleared; the caller rejects them earlier.
pub(crate) fn encode_texel(format: TextureFormat, color: [f32; 4]) -> Vec<u8> {
    let [r, g, b, a] = color;
    match format {
        TextureFormat::R8Unorm => vec![unorm8(r)],
        TextureFormat::Rg8Unorm => vec![unorm8(r), unorm8(g)],
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)]
        }
        TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb => {
            vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]
        }
        TextureFormat::Rgb10A2Unorm => {
            let r10 = (r.clamp(0.0, 1.0) * 1023.0 + 0.5) as u32;
            let g10 = (g.clamp(0.0, 1.0) * 1023.0 + 0.5) as u32;
            let b10 = (b.clamp(0.0, 1.0) * 1023.0 + 0.5) as u32;
            let a2 = (a.clamp(0.0, 1.0) * 3.0 + 0.5) as u32;
            (r10 | (g10 << 10) | (b10 << 20) | (a2 << 30)).to_le_bytes().to_vec()
        }
        TextureFormat::R16Float => f32_to_f16_bits(r).to_le_bytes().to_vec(),
        TextureFormat::Rg16Float => {
            let mut out = f32_to_f16_bits(r).to_le_bytes().to_vec();
            out.extend_from_slice(&f32_to_f16_bits(g).to_le_bytes());
            out
        }
        TextureFormat::Rgba16Float => {
            let mut out = Vec::with_capacity(8);
            for c in [r, g, b, a] {
                out.extend_from_slice(&f32_to_f16_bits(c).to_le_bytes());
            }
            out
        }
        TextureFormat::R32Float => r.to_le_bytes().to_vec(),
        TextureFormat::Rg32Float => {
            let mut out = r.to_le_bytes().to_vec();
            out.extend_from_slice(&g.to_le_bytes());
            out
        }
        TextureFormat::Rgba32Float => {
            let mut out = Vec::with_capacity(16);
            for c in [r, g, b, a] {
                out.extend_from_slice(&c.to_le_bytes());
            }
            out
        }
        TextureFormat::R32Uint => (r as u32).to_le_bytes().to_vec(),
        TextureFormat::Rgba32Uint => {
            let mut out = Vec::with_capacity(16);
            for c in [r, g, b, a] {
                out.extend_from_slice(&(c as u32).to_le_bytes());
            }
            out
        }
        TextureFormat::D16Unorm => {
            ((r.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16).to_le_bytes().to_vec()
        }
        TextureFormat::D24UnormS8Uint => {
            let d24 = (r.clamp(0.0, 1.0) * 16_777_215.0 + 0.5) as u32;
            (d24 | ((g as u32 & 0xff) << 24)).to_le_bytes().to_vec()
        }
        TextureFormat::D32Float => r.to_le_bytes().to_vec(),
        TextureFormat::D32FloatS8Uint => {
            let mut out = r.to_le_bytes().to_vec();
            out.extend_from_slice(&[g as u8, 0, 0, 0]);
            out
        }
        TextureFormat::Bc1RgbaUnorm | TextureFormat::Bc3RgbaUnorm | TextureFormat::Bc7RgbaUnorm => {
            vec![0u8; format.texel_block_size() as usize]
        }
    }
}

/// Fills one sub-resource slab with the encoded texel.
pub(crate) fn fill_slab(slab: &mut [u8], texel: &[u8]) {
    for chunk in slab.chunks_exact_mut(texel.len()) {
        chunk.copy_from_slice(texel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_float_round_trip_simple_values() {
        assert_eq!(f32_to_f16_bits(0.0), 0);
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
    }

    #[test]
    fn level_pitch_accounts_for_block_compression() {
        let desc = RawTextureDesc {
            texture_type: TextureType::D2,
            format: TextureFormat::Bc1RgbaUnorm,
            usage: TextureUsage::SAMPLER,
            width: 16,
            height: 16,
            depth: 1,
            layer_count: 1,
            level_count: 3,
            sample_count: SampleCount::One,
        };
        // 16 texels = 4 blocks of 8 bytes.
        assert_eq!(desc.level_row_pitch(0), 32);
        // 4x4 level = a single block.
        assert_eq!(desc.level_row_pitch(2), 8);
        assert_eq!(desc.level_row_count(2), 1);
    }

    #[test]
    fn upload_heap_rejects_transitions() {
        let device = RawDevice::new(true, 0);
        let buffer = RawBuffer::new(&device, 64, HeapKind::Upload);
        buffer.transition(&device, ResourceState::Common, ResourceState::CopySource);
        assert_eq!(device.take_validation_messages().len(), 1);
        assert_eq!(buffer.current_state(), ResourceState::GenericRead);
    }
}
