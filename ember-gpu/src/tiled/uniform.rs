//! Pooled uniform upload buffers.
//!
//! Push-uniform data is sub-allocated out of fixed-size persistently mapped
//! upload buffers in 256-byte blocks. The draw offset snapshots the most
//! recent push, and draws bind it as a root CBV, so uniform updates stay O(1)
//! at record time and every push between two draws gets its own block.

use std::sync::Arc;

use crate::error::Result;
use crate::BufferUsage;

use super::resource::{BufferKind, ConcreteBuffer};
use super::DeviceShared;

/// Pool element size. Large enough that a pass rarely spills into a second
/// buffer, small enough to keep the pool cheap.
pub(crate) const UNIFORM_BUFFER_POOL_SIZE: u64 = 32 * 1024;
/// Constant-buffer offset alignment of the tiled backend.
pub(crate) const UNIFORM_ALIGNMENT: u32 = 256;

/// A pooled uniform buffer wrapper. Invariants: `draw_offset <= write_offset
/// <= size`; `current_block_size` is the aligned size of the latest push.
pub(crate) struct UniformBuffer {
    pub(crate) buffer: Arc<ConcreteBuffer>,
    pub(crate) write_offset: u32,
    pub(crate) draw_offset: u32,
    #[allow(dead_code)]
    pub(crate) current_block_size: u32,
}

impl UniformBuffer {
    fn create(device: &Arc<DeviceShared>) -> Result<Self> {
        let buffer = ConcreteBuffer::create(
            device,
            BufferUsage::empty(),
            BufferKind::UniformUpload,
            UNIFORM_BUFFER_POOL_SIZE,
            Some("pooled uniform buffer"),
        )?;
        Ok(Self { buffer, write_offset: 0, draw_offset: 0, current_block_size: 0 })
    }

    pub(crate) fn reset(&mut self) {
        self.write_offset = 0;
        self.draw_offset = 0;
        self.current_block_size = 0;
    }

    pub(crate) fn has_room(&self, block: u32) -> bool {
        self.write_offset as u64 + block as u64 <= UNIFORM_BUFFER_POOL_SIZE
    }

    /// Copies `data` at the write cursor and snapshots it as the draw offset.
    pub(crate) fn push(&mut self, data: &[u8]) {
        let block = align_block(data.len() as u32);
        debug_assert!(self.has_room(block));
        self.draw_offset = self.write_offset;
        self.current_block_size = block;
        let at = self.write_offset as usize;
        self.buffer.raw.storage()[at..at + data.len()].copy_from_slice(data);
        self.write_offset += block;
    }

    pub(crate) fn draw_address(&self) -> u64 {
        self.buffer.raw.gpu_address + self.draw_offset as u64
    }
}

pub(crate) fn align_block(len: u32) -> u32 {
    len.div_ceil(UNIFORM_ALIGNMENT) * UNIFORM_ALIGNMENT
}

/// Pops the device pool, or creates a fresh wrapper when it is empty. The
/// returned wrapper starts at offset zero with its backing buffer mapped.
pub(crate) fn acquire_uniform_buffer(device: &Arc<DeviceShared>) -> Result<UniformBuffer> {
    let pooled = device.available_uniform_buffers.lock().unwrap().pop();
    let mut wrapper = match pooled {
        Some(wrapper) => wrapper,
        None => UniformBuffer::create(device)?,
    };
    wrapper.reset();
    Ok(wrapper)
}

/// Returns retired wrappers to the pool once their command buffer is done.
pub(crate) fn return_uniform_buffers(
    device: &DeviceShared,
    buffers: impl IntoIterator<Item = UniformBuffer>,
) {
    let mut pool = device.available_uniform_buffers.lock().unwrap();
    pool.extend(buffers);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_round_up_to_the_alignment() {
        assert_eq!(align_block(1), 256);
        assert_eq!(align_block(256), 256);
        assert_eq!(align_block(257), 512);
    }
}
