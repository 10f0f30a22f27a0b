//! Automatic resource-state tracking.
//!
//! Every resource has a default state derived from its usage flags; the
//! tracker emits a transition away from it at the start of an operation that
//! needs a different state, and a transition back at the end. Write-storage
//! access additionally gets a UAV barrier to order GPU-side writes. A just
//! created buffer sits in the common state until its first transition,
//! whichever state its usage would default to.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::{BufferUsage, TextureUsage};

use super::native::list::{BarrierTarget, RawCommand, RawCommandList};
use super::native::resource::ResourceState;
use super::resource::{BufferContainer, ConcreteBuffer, ConcreteTexture, TextureContainer};
use super::DeviceShared;

/// Usage-derived default state for buffers. First matching usage wins.
pub(crate) fn buffer_default_state(usage: BufferUsage) -> ResourceState {
    if usage.contains(BufferUsage::VERTEX) {
        ResourceState::VertexAndConstantBuffer
    } else if usage.contains(BufferUsage::INDEX) {
        ResourceState::IndexBuffer
    } else if usage.contains(BufferUsage::INDIRECT) {
        ResourceState::IndirectArgument
    } else if usage.contains(BufferUsage::GRAPHICS_STORAGE_READ) {
        ResourceState::AllShaderResource
    } else if usage.contains(BufferUsage::COMPUTE_STORAGE_READ) {
        ResourceState::NonPixelShaderResource
    } else if usage.contains(BufferUsage::COMPUTE_STORAGE_WRITE) {
        ResourceState::UnorderedAccess
    } else {
        ResourceState::Common
    }
}

/// Usage-derived default state for textures. First matching usage wins.
pub(crate) fn texture_default_state(usage: TextureUsage) -> ResourceState {
    if usage.intersects(TextureUsage::SAMPLER | TextureUsage::GRAPHICS_STORAGE_READ) {
        ResourceState::AllShaderResource
    } else if usage.contains(TextureUsage::COLOR_TARGET) {
        ResourceState::RenderTarget
    } else if usage.contains(TextureUsage::DEPTH_STENCIL_TARGET) {
        ResourceState::DepthWrite
    } else if usage.contains(TextureUsage::COMPUTE_STORAGE_READ) {
        ResourceState::NonPixelShaderResource
    } else if usage.contains(TextureUsage::COMPUTE_STORAGE_WRITE) {
        ResourceState::UnorderedAccess
    } else {
        ResourceState::Common
    }
}

/// Transitions a buffer from its default state into `dest`. The first
/// transition of a concrete buffer is issued against the common state its
/// heap committed it in, regardless of the recorded default. Upload-heap
/// buffers never transition.
pub(crate) fn transition_buffer_from_default(
    list: &mut RawCommandList,
    usage: BufferUsage,
    buffer: &Arc<ConcreteBuffer>,
    dest: ResourceState,
) {
    if buffer.raw.heap != super::native::resource::HeapKind::Default {
        return;
    }
    let before = if buffer.transitioned.swap(true, Ordering::AcqRel) {
        buffer_default_state(usage)
    } else {
        ResourceState::Common
    };
    if before != dest {
        list.push(RawCommand::Transition {
            target: BarrierTarget::Buffer(Arc::clone(&buffer.raw)),
            before,
            after: dest,
        });
    }
    if dest == ResourceState::UnorderedAccess {
        list.push(RawCommand::UavBarrier {
            target: BarrierTarget::Buffer(Arc::clone(&buffer.raw)),
        });
    }
}

pub(crate) fn transition_buffer_to_default(
    list: &mut RawCommandList,
    usage: BufferUsage,
    buffer: &Arc<ConcreteBuffer>,
    from: ResourceState,
) {
    if buffer.raw.heap != super::native::resource::HeapKind::Default {
        return;
    }
    let default = buffer_default_state(usage);
    if from != default {
        list.push(RawCommand::Transition {
            target: BarrierTarget::Buffer(Arc::clone(&buffer.raw)),
            before: from,
            after: default,
        });
    }
}

pub(crate) fn transition_texture_from_default(
    list: &mut RawCommandList,
    texture: &Arc<ConcreteTexture>,
    subresource: u32,
    dest: ResourceState,
) {
    let default = texture.default_state();
    if default != dest {
        list.push(RawCommand::Transition {
            target: BarrierTarget::TextureSubresource(Arc::clone(&texture.raw), subresource),
            before: default,
            after: dest,
        });
    }
    if dest == ResourceState::UnorderedAccess {
        list.push(RawCommand::UavBarrier {
            target: BarrierTarget::TextureSubresource(Arc::clone(&texture.raw), subresource),
        });
    }
}

pub(crate) fn transition_texture_to_default(
    list: &mut RawCommandList,
    texture: &Arc<ConcreteTexture>,
    subresource: u32,
    from: ResourceState,
) {
    let default = texture.default_state();
    if from != default {
        list.push(RawCommand::Transition {
            target: BarrierTarget::TextureSubresource(Arc::clone(&texture.raw), subresource),
            before: from,
            after: default,
        });
    }
}

/// Cycles the container when asked and the active buffer is in flight, then
/// transitions the selected buffer for writing. Returns the buffer writes
/// will land in.
pub(crate) fn prepare_buffer_for_write(
    device: &Arc<DeviceShared>,
    list: &mut RawCommandList,
    container: &Arc<BufferContainer>,
    cycle: bool,
    dest: ResourceState,
) -> Result<Arc<ConcreteBuffer>> {
    if cycle && container.active().in_flight() {
        container.cycle_active(device)?;
    }
    let buffer = container.active();
    transition_buffer_from_default(list, container.usage, &buffer, dest);
    Ok(buffer)
}

/// Texture analog of [`prepare_buffer_for_write`], at sub-resource
/// granularity. Swapchain containers are never cycled.
pub(crate) fn prepare_texture_subresource_for_write(
    device: &Arc<DeviceShared>,
    list: &mut RawCommandList,
    container: &Arc<TextureContainer>,
    layer: u32,
    level: u32,
    cycle: bool,
    dest: ResourceState,
) -> Result<(Arc<ConcreteTexture>, u32)> {
    let active = container.active();
    let subresource = active.subresource_index(layer, level);
    if cycle
        && container.can_be_cycled
        && active.subresources[subresource as usize].in_flight()
    {
        container.cycle_active(device)?;
    }
    let texture = container.active();
    if texture.is_swapchain {
        // Acquisition already moved the back buffer to render-target; the
        // begin-pass transition is a no-op by construction.
        return Ok((texture, subresource));
    }
    transition_texture_from_default(list, &texture, subresource, dest);
    Ok((texture, subresource))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_defaults_follow_priority_order() {
        assert_eq!(
            buffer_default_state(BufferUsage::VERTEX | BufferUsage::COMPUTE_STORAGE_WRITE),
            ResourceState::VertexAndConstantBuffer
        );
        assert_eq!(buffer_default_state(BufferUsage::INDEX), ResourceState::IndexBuffer);
        assert_eq!(
            buffer_default_state(BufferUsage::INDIRECT | BufferUsage::COMPUTE_STORAGE_READ),
            ResourceState::IndirectArgument
        );
        assert_eq!(
            buffer_default_state(
                BufferUsage::GRAPHICS_STORAGE_READ | BufferUsage::COMPUTE_STORAGE_READ
            ),
            ResourceState::AllShaderResource
        );
        assert_eq!(
            buffer_default_state(BufferUsage::COMPUTE_STORAGE_READ),
            ResourceState::NonPixelShaderResource
        );
        assert_eq!(
            buffer_default_state(BufferUsage::COMPUTE_STORAGE_WRITE),
            ResourceState::UnorderedAccess
        );
    }

    #[test]
    fn texture_defaults_follow_priority_order() {
        assert_eq!(
            texture_default_state(TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET),
            ResourceState::AllShaderResource
        );
        assert_eq!(
            texture_default_state(TextureUsage::COLOR_TARGET),
            ResourceState::RenderTarget
        );
        assert_eq!(
            texture_default_state(TextureUsage::DEPTH_STENCIL_TARGET),
            ResourceState::DepthWrite
        );
        assert_eq!(
            texture_default_state(TextureUsage::COMPUTE_STORAGE_READ),
            ResourceState::NonPixelShaderResource
        );
        assert_eq!(
            texture_default_state(TextureUsage::COMPUTE_STORAGE_WRITE),
            ResourceState::UnorderedAccess
        );
    }
}
