//! Raw command lists and their executor.
//!
//! A list records encoded commands; the queue executes them synchronously,
//! applying memory effects (copies, clears, built-in compute programs) and
//! validating barriers and draw/dispatch preconditions against the live
//! resource states. Draws are validated but not rasterized.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{IndexElementSize, PrimitiveTopology, Rect, TextureFormat, Viewport};

use super::heap::{RawDescriptor, RawDescriptorHeap};
use super::pipeline::{
    BindGroup, RawComputePipeline, RawGraphicsPipeline, RawRootSignature, RootParameter,
    TableKind, UniformStage,
};
use super::resource::{encode_texel, fill_slab, RawBuffer, RawTexture, ResourceState};
use super::shader::ComputeProgram;
use super::RawDevice;

/// Root CBV snapshots are clamped to one constant-buffer alignment block.
const UNIFORM_SNAPSHOT_BYTES: usize = 256;

#[derive(Debug, Clone)]
pub(crate) enum BarrierTarget {
    Buffer(Arc<RawBuffer>),
    TextureSubresource(Arc<RawTexture>, u32),
}

#[derive(Debug, Clone)]
pub(crate) enum RawCommand {
    SetDescriptorHeaps {
        view: Arc<RawDescriptorHeap>,
        sampler: Arc<RawDescriptorHeap>,
    },
    Transition {
        target: BarrierTarget,
        before: ResourceState,
        after: ResourceState,
    },
    UavBarrier {
        target: BarrierTarget,
    },
    ClearRenderTarget {
        texture: Arc<RawTexture>,
        subresource: u32,
        color: [f32; 4],
    },
    ClearDepthStencil {
        texture: Arc<RawTexture>,
        subresource: u32,
        depth: f32,
        stencil: u8,
        clear_depth: bool,
        clear_stencil: bool,
    },
    SetRenderTargets {
        colors: Vec<(Arc<RawTexture>, u32, TextureFormat)>,
        depth: Option<(Arc<RawTexture>, u32)>,
    },
    SetViewport(Viewport),
    SetScissor(Rect),
    SetBlendConstants([f32; 4]),
    SetStencilReference(u8),
    SetTopology(PrimitiveTopology),
    SetGraphicsRootSignature(Arc<RawRootSignature>),
    SetComputeRootSignature(Arc<RawRootSignature>),
    SetGraphicsPipeline(Arc<RawGraphicsPipeline>),
    SetComputePipeline(Arc<RawComputePipeline>),
    SetGraphicsRootDescriptorTable {
        parameter: u32,
        heap: Arc<RawDescriptorHeap>,
        base: u32,
    },
    SetComputeRootDescriptorTable {
        parameter: u32,
        heap: Arc<RawDescriptorHeap>,
        base: u32,
    },
    SetGraphicsRootConstantBuffer {
        parameter: u32,
        address: u64,
        buffer: Arc<RawBuffer>,
        offset: u64,
    },
    SetComputeRootConstantBuffer {
        parameter: u32,
        address: u64,
        buffer: Arc<RawBuffer>,
        offset: u64,
    },
    SetVertexBuffers {
        first_slot: u32,
        buffers: Vec<(Arc<RawBuffer>, u64)>,
    },
    SetIndexBuffer {
        buffer: Arc<RawBuffer>,
        offset: u64,
        format: IndexElementSize,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: Arc<RawBuffer>,
        offset: u64,
        indexed: bool,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: Arc<RawBuffer>,
        offset: u64,
    },
    CopyBufferRegion {
        src: Arc<RawBuffer>,
        src_offset: u64,
        dst: Arc<RawBuffer>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        buffer: Arc<RawBuffer>,
        buffer_offset: u64,
        row_pitch: u32,
        texture: Arc<RawTexture>,
        subresource: u32,
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
    },
    CopyTextureToBuffer {
        texture: Arc<RawTexture>,
        subresource: u32,
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
        buffer: Arc<RawBuffer>,
        buffer_offset: u64,
        row_pitch: u32,
    },
    CopyTextureToTexture {
        src: Arc<RawTexture>,
        src_subresource: u32,
        src_origin: (u32, u32, u32),
        dst: Arc<RawTexture>,
        dst_subresource: u32,
        dst_origin: (u32, u32, u32),
        extent: (u32, u32, u32),
    },
    DebugLabel(String),
    PushDebugGroup(String),
    PopDebugGroup,
}

/// A command allocator + list pair. `reset` recycles both.
#[derive(Debug, Default)]
pub(crate) struct RawCommandList {
    ops: Vec<RawCommand>,
    closed: bool,
}

impl RawCommandList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, op: RawCommand) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.ops.push(op);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn reset(&mut self) {
        self.ops.clear();
        self.closed = false;
    }

    pub(crate) fn ops(&self) -> &[RawCommand] {
        &self.ops
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DrawKind {
    Draw,
    DrawIndexed,
    DrawIndirect,
    Dispatch,
}

#[derive(Debug, Clone)]
pub(crate) struct UniformSnapshot {
    pub(crate) stage: UniformStage,
    pub(crate) slot: u32,
    pub(crate) data: Vec<u8>,
}

/// One executed draw or dispatch, captured for the debug layer.
#[derive(Debug, Clone)]
pub(crate) struct DrawRecord {
    pub(crate) kind: DrawKind,
    pub(crate) pipeline_id: u64,
    pub(crate) uniforms: Vec<UniformSnapshot>,
}

#[derive(Clone)]
enum RootBinding {
    Table { heap: Arc<RawDescriptorHeap>, base: u32 },
    ConstantBuffer { buffer: Arc<RawBuffer>, offset: u64 },
}

#[derive(Default)]
struct ExecState {
    view_heap: Option<Arc<RawDescriptorHeap>>,
    sampler_heap: Option<Arc<RawDescriptorHeap>>,
    render_targets: Vec<(Arc<RawTexture>, u32, TextureFormat)>,
    depth_target: Option<(Arc<RawTexture>, u32)>,
    graphics_root: Option<Arc<RawRootSignature>>,
    compute_root: Option<Arc<RawRootSignature>>,
    graphics_pipeline: Option<Arc<RawGraphicsPipeline>>,
    compute_pipeline: Option<Arc<RawComputePipeline>>,
    graphics_bindings: HashMap<u32, RootBinding>,
    compute_bindings: HashMap<u32, RootBinding>,
    topology: Option<PrimitiveTopology>,
    index_buffer: Option<(Arc<RawBuffer>, u64, IndexElementSize)>,
    debug_group_depth: i32,
}

pub(crate) fn execute(device: &RawDevice, list: &RawCommandList) {
    let mut state = ExecState::default();
    for op in list.ops() {
        execute_op(device, &mut state, op);
    }
    if state.debug_group_depth != 0 {
        device.validation_error(format!(
            "unbalanced debug groups at end of list ({} open)",
            state.debug_group_depth
        ));
    }
}

fn readable_for_copy(state: ResourceState) -> bool {
    matches!(state, ResourceState::CopySource | ResourceState::GenericRead)
}

fn execute_op(device: &RawDevice, state: &mut ExecState, op: &RawCommand) {
    match op {
        RawCommand::SetDescriptorHeaps { view, sampler } => {
            if !view.shader_visible || !sampler.shader_visible {
                device.validation_error("SetDescriptorHeaps with a non-shader-visible heap".into());
            }
            state.view_heap = Some(Arc::clone(view));
            state.sampler_heap = Some(Arc::clone(sampler));
        }
        RawCommand::Transition { target, before, after } => match target {
            BarrierTarget::Buffer(buffer) => buffer.transition(device, *before, *after),
            BarrierTarget::TextureSubresource(texture, sub) => {
                texture.transition(device, *sub, *before, *after)
            }
        },
        RawCommand::UavBarrier { .. } => {}
        RawCommand::ClearRenderTarget { texture, subresource, color } => {
            if texture.subresource_state(*subresource) != ResourceState::RenderTarget {
                device.validation_error(format!(
                    "clear of texture {} sub-resource {} outside RenderTarget state",
                    texture.id, subresource
                ));
            }
            let texel = encode_texel(texture.desc.format, *color);
            fill_slab(&mut texture.slab(*subresource), &texel);
        }
        RawCommand::ClearDepthStencil {
            texture,
            subresource,
            depth,
            stencil,
            clear_depth,
            clear_stencil,
        } => {
            if texture.subresource_state(*subresource) != ResourceState::DepthWrite {
                device.validation_error(format!(
                    "depth clear of texture {} sub-resource {} outside DepthWrite state",
                    texture.id, subresource
                ));
            }
            if *clear_depth || *clear_stencil {
                let texel = encode_texel(texture.desc.format, [*depth, *stencil as f32, 0.0, 0.0]);
                fill_slab(&mut texture.slab(*subresource), &texel);
            }
        }
        RawCommand::SetRenderTargets { colors, depth } => {
            state.render_targets = colors.clone();
            state.depth_target = depth.clone();
        }
        RawCommand::SetViewport(_) | RawCommand::SetScissor(_) => {}
        RawCommand::SetBlendConstants(_) | RawCommand::SetStencilReference(_) => {}
        RawCommand::SetTopology(topology) => state.topology = Some(*topology),
        RawCommand::SetGraphicsRootSignature(signature) => {
            state.graphics_root = Some(Arc::clone(signature));
            state.graphics_bindings.clear();
        }
        RawCommand::SetComputeRootSignature(signature) => {
            state.compute_root = Some(Arc::clone(signature));
            state.compute_bindings.clear();
        }
        RawCommand::SetGraphicsPipeline(pipeline) => {
            state.graphics_pipeline = Some(Arc::clone(pipeline));
        }
        RawCommand::SetComputePipeline(pipeline) => {
            state.compute_pipeline = Some(Arc::clone(pipeline));
        }
        RawCommand::SetGraphicsRootDescriptorTable { parameter, heap, base } => {
            state
                .graphics_bindings
                .insert(*parameter, RootBinding::Table { heap: Arc::clone(heap), base: *base });
        }
        RawCommand::SetComputeRootDescriptorTable { parameter, heap, base } => {
            state
                .compute_bindings
                .insert(*parameter, RootBinding::Table { heap: Arc::clone(heap), base: *base });
        }
        RawCommand::SetGraphicsRootConstantBuffer { parameter, address, buffer, offset } => {
            if buffer.gpu_address + offset != *address {
                device.validation_error(format!(
                    "root CBV address {:#x} does not match buffer {} + {:#x}",
                    address, buffer.id, offset
                ));
            }
            state.graphics_bindings.insert(
                *parameter,
                RootBinding::ConstantBuffer { buffer: Arc::clone(buffer), offset: *offset },
            );
        }
        RawCommand::SetComputeRootConstantBuffer { parameter, address, buffer, offset } => {
            if buffer.gpu_address + offset != *address {
                device.validation_error(format!(
                    "root CBV address {:#x} does not match buffer {} + {:#x}",
                    address, buffer.id, offset
                ));
            }
            state.compute_bindings.insert(
                *parameter,
                RootBinding::ConstantBuffer { buffer: Arc::clone(buffer), offset: *offset },
            );
        }
        RawCommand::SetVertexBuffers { .. } => {}
        RawCommand::SetIndexBuffer { buffer, offset, format } => {
            state.index_buffer = Some((Arc::clone(buffer), *offset, *format));
        }
        RawCommand::Draw { .. } => validate_draw(device, state, DrawKind::Draw, false),
        RawCommand::DrawIndexed { .. } => validate_draw(device, state, DrawKind::DrawIndexed, true),
        RawCommand::DrawIndirect { buffer, offset, indexed } => {
            if !matches!(
                buffer.current_state(),
                ResourceState::IndirectArgument | ResourceState::GenericRead
            ) {
                device.validation_error(format!(
                    "indirect draw argument buffer {} not in IndirectArgument state",
                    buffer.id
                ));
            }
            let needed = if *indexed { 20 } else { 16 };
            if offset + needed > buffer.size {
                device.validation_error("indirect draw arguments out of buffer bounds".into());
            }
            validate_draw(device, state, DrawKind::DrawIndirect, *indexed);
        }
        RawCommand::Dispatch { x, y, z } => run_dispatch(device, state, (*x, *y, *z)),
        RawCommand::DispatchIndirect { buffer, offset } => {
            if !matches!(
                buffer.current_state(),
                ResourceState::IndirectArgument | ResourceState::GenericRead
            ) {
                device.validation_error(format!(
                    "indirect dispatch argument buffer {} not in IndirectArgument state",
                    buffer.id
                ));
            }
            if offset + 12 > buffer.size {
                device.validation_error("indirect dispatch arguments out of buffer bounds".into());
                return;
            }
            let storage = buffer.storage();
            let at = *offset as usize;
            let word = |i: usize| {
                u32::from_le_bytes([
                    storage[at + i * 4],
                    storage[at + i * 4 + 1],
                    storage[at + i * 4 + 2],
                    storage[at + i * 4 + 3],
                ])
            };
            let groups = (word(0), word(1), word(2));
            drop(storage);
            run_dispatch(device, state, groups);
        }
        RawCommand::CopyBufferRegion { src, src_offset, dst, dst_offset, size } => {
            if !readable_for_copy(src.current_state()) {
                device.validation_error(format!(
                    "copy source buffer {} not in CopySource state",
                    src.id
                ));
            }
            if dst.current_state() != ResourceState::CopyDest {
                device.validation_error(format!(
                    "copy destination buffer {} not in CopyDest state",
                    dst.id
                ));
            }
            if src_offset + size > src.size || dst_offset + size > dst.size {
                device.validation_error("buffer copy out of bounds".into());
                return;
            }
            let data =
                src.storage()[*src_offset as usize..(*src_offset + *size) as usize].to_vec();
            dst.storage()[*dst_offset as usize..(*dst_offset + *size) as usize]
                .copy_from_slice(&data);
        }
        RawCommand::CopyBufferToTexture {
            buffer,
            buffer_offset,
            row_pitch,
            texture,
            subresource,
            x,
            y,
            z,
            w,
            h,
            d,
        } => {
            if !readable_for_copy(buffer.current_state()) {
                device.validation_error(format!(
                    "texture upload source buffer {} not readable",
                    buffer.id
                ));
            }
            if texture.subresource_state(*subresource) != ResourceState::CopyDest {
                device.validation_error(format!(
                    "texture {} sub-resource {} upload outside CopyDest state",
                    texture.id, subresource
                ));
            }
            copy_buffer_texture(
                device, buffer, *buffer_offset, *row_pitch, texture, *subresource,
                (*x, *y, *z), (*w, *h, *d), true,
            );
        }
        RawCommand::CopyTextureToBuffer {
            texture,
            subresource,
            x,
            y,
            z,
            w,
            h,
            d,
            buffer,
            buffer_offset,
            row_pitch,
        } => {
            if texture.subresource_state(*subresource) != ResourceState::CopySource {
                device.validation_error(format!(
                    "texture {} sub-resource {} download outside CopySource state",
                    texture.id, subresource
                ));
            }
            if buffer.current_state() != ResourceState::CopyDest {
                device.validation_error(format!(
                    "texture download destination buffer {} not in CopyDest state",
                    buffer.id
                ));
            }
            copy_buffer_texture(
                device, buffer, *buffer_offset, *row_pitch, texture, *subresource,
                (*x, *y, *z), (*w, *h, *d), false,
            );
        }
        RawCommand::CopyTextureToTexture {
            src,
            src_subresource,
            src_origin,
            dst,
            dst_subresource,
            dst_origin,
            extent,
        } => {
            if src.subresource_state(*src_subresource) != ResourceState::CopySource {
                device.validation_error(format!(
                    "texture copy source {} sub-resource {} not in CopySource state",
                    src.id, src_subresource
                ));
            }
            if dst.subresource_state(*dst_subresource) != ResourceState::CopyDest {
                device.validation_error(format!(
                    "texture copy destination {} sub-resource {} not in CopyDest state",
                    dst.id, dst_subresource
                ));
            }
            copy_texture_texture(
                device,
                src,
                *src_subresource,
                *src_origin,
                dst,
                *dst_subresource,
                *dst_origin,
                *extent,
            );
        }
        RawCommand::DebugLabel(_) => {}
        RawCommand::PushDebugGroup(_) => state.debug_group_depth += 1,
        RawCommand::PopDebugGroup => {
            state.debug_group_depth -= 1;
            if state.debug_group_depth < 0 {
                device.validation_error("debug group pop without a matching push".into());
            }
        }
    }
}

fn snapshot_uniforms(
    signature: &RawRootSignature,
    bindings: &HashMap<u32, RootBinding>,
) -> Vec<UniformSnapshot> {
    let mut snapshots = Vec::new();
    for (index, parameter) in signature.parameters.iter().enumerate() {
        if let RootParameter::ConstantBuffer { stage, slot, .. } = parameter {
            if let Some(RootBinding::ConstantBuffer { buffer, offset }) =
                bindings.get(&(index as u32))
            {
                let storage = buffer.storage();
                let start = (*offset as usize).min(storage.len());
                let end = (start + UNIFORM_SNAPSHOT_BYTES).min(storage.len());
                snapshots.push(UniformSnapshot {
                    stage: *stage,
                    slot: *slot,
                    data: storage[start..end].to_vec(),
                });
            }
        }
    }
    snapshots
}

/// Checks that every root parameter the signature declares has been bound,
/// that tables point into the currently-set shader-visible heaps, and that
/// the table entries are populated with the expected descriptor class.
fn validate_root_bindings(
    device: &RawDevice,
    state: &ExecState,
    signature: &RawRootSignature,
    bindings: &HashMap<u32, RootBinding>,
    what: &str,
) {
    for (index, parameter) in signature.parameters.iter().enumerate() {
        let binding = bindings.get(&(index as u32));
        match (parameter, binding) {
            (RootParameter::Table { kind, count, group, .. }, Some(RootBinding::Table { heap, base })) => {
                let expected_heap = match kind {
                    TableKind::Sampler => state.sampler_heap.as_ref(),
                    TableKind::Srv | TableKind::Uav => state.view_heap.as_ref(),
                };
                match expected_heap {
                    Some(current) if Arc::ptr_eq(current, heap) => {}
                    _ => device.validation_error(format!(
                        "{what}: table for {group:?} does not point into the bound heap"
                    )),
                }
                for slot in 0..*count {
                    if matches!(heap.read(base + slot), RawDescriptor::Empty) {
                        device.validation_error(format!(
                            "{what}: table for {group:?} references empty descriptor slot {slot}"
                        ));
                    }
                }
            }
            (RootParameter::Table { group, .. }, _) => {
                device.validation_error(format!("{what}: no table bound for {group:?}"));
            }
            (RootParameter::ConstantBuffer { stage, slot, .. }, Some(RootBinding::ConstantBuffer { .. })) => {
                let _ = (stage, slot);
            }
            (RootParameter::ConstantBuffer { stage, slot, .. }, _) => {
                device.validation_error(format!(
                    "{what}: no root CBV bound for {stage:?} uniform slot {slot}"
                ));
            }
        }
    }
}

fn validate_draw(device: &RawDevice, state: &ExecState, kind: DrawKind, indexed: bool) {
    let Some(pipeline) = state.graphics_pipeline.as_ref() else {
        device.validation_error("draw without a graphics pipeline".into());
        return;
    };
    match state.graphics_root.as_ref() {
        Some(root) if Arc::ptr_eq(root, &pipeline.root_signature) => {}
        _ => device.validation_error("draw with a stale graphics root signature".into()),
    }
    if state.topology != Some(pipeline.topology) {
        device.validation_error("draw topology does not match the pipeline".into());
    }
    if indexed && state.index_buffer.is_none() {
        device.validation_error("indexed draw without an index buffer".into());
    }
    let target_formats: Vec<TextureFormat> =
        state.render_targets.iter().map(|(_, _, format)| *format).collect();
    if target_formats != pipeline.color_formats {
        device.validation_error(format!(
            "draw color target formats {:?} do not match pipeline {:?}",
            target_formats, pipeline.color_formats
        ));
    }
    if pipeline.depth_format.is_some() != state.depth_target.is_some() {
        device.validation_error("draw depth attachment does not match the pipeline".into());
    }
    for (texture, subresource, _) in &state.render_targets {
        if texture.subresource_state(*subresource) != ResourceState::RenderTarget {
            device.validation_error(format!(
                "draw against texture {} sub-resource {} outside RenderTarget state",
                texture.id, subresource
            ));
        }
        if texture.desc.sample_count != pipeline.sample_count {
            device.validation_error(format!(
                "draw sample count {:?} does not match pipeline {:?}",
                texture.desc.sample_count, pipeline.sample_count
            ));
        }
    }
    if let Some((texture, subresource)) = &state.depth_target {
        if texture.subresource_state(*subresource) != ResourceState::DepthWrite {
            device.validation_error(format!(
                "draw against depth texture {} outside DepthWrite state",
                texture.id
            ));
        }
    }
    validate_root_bindings(
        device,
        state,
        &pipeline.root_signature,
        &state.graphics_bindings,
        "draw",
    );
    device.record_draw(DrawRecord {
        kind,
        pipeline_id: pipeline.id,
        uniforms: snapshot_uniforms(&pipeline.root_signature, &state.graphics_bindings),
    });
}

fn run_dispatch(device: &RawDevice, state: &ExecState, groups: (u32, u32, u32)) {
    let Some(pipeline) = state.compute_pipeline.as_ref() else {
        device.validation_error("dispatch without a compute pipeline".into());
        return;
    };
    match state.compute_root.as_ref() {
        Some(root) if Arc::ptr_eq(root, &pipeline.root_signature) => {}
        _ => device.validation_error("dispatch with a stale compute root signature".into()),
    }
    validate_root_bindings(
        device,
        state,
        &pipeline.root_signature,
        &state.compute_bindings,
        "dispatch",
    );
    device.record_draw(DrawRecord {
        kind: DrawKind::Dispatch,
        pipeline_id: pipeline.id,
        uniforms: snapshot_uniforms(&pipeline.root_signature, &state.compute_bindings),
    });

    // Built-in programs operate on read-write storage buffer slot 0.
    let target = read_write_buffer_slot0(device, state, pipeline);
    let (tx, ty, tz) = pipeline.thread_count;
    let invocations =
        groups.0 as u64 * groups.1 as u64 * groups.2 as u64 * tx as u64 * ty as u64 * tz as u64;
    match pipeline.program {
        ComputeProgram::StoreGlobalIndex => {
            if let Some(buffer) = target {
                let mut storage = buffer.storage();
                let words = (storage.len() / 4) as u64;
                for index in 0..invocations.min(words) {
                    let at = (index * 4) as usize;
                    storage[at..at + 4].copy_from_slice(&(index as u32).to_le_bytes());
                }
            }
        }
        ComputeProgram::FillWord(word) => {
            if let Some(buffer) = target {
                let mut storage = buffer.storage();
                let words = (storage.len() / 4) as u64;
                for index in 0..invocations.min(words) {
                    let at = (index * 4) as usize;
                    storage[at..at + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
        }
    }
}

fn read_write_buffer_slot0(
    device: &RawDevice,
    state: &ExecState,
    pipeline: &RawComputePipeline,
) -> Option<Arc<RawBuffer>> {
    for (index, parameter) in pipeline.root_signature.parameters.iter().enumerate() {
        let RootParameter::Table { group: BindGroup::ComputeWriteStorageBuffers, .. } = parameter
        else {
            continue;
        };
        let Some(RootBinding::Table { heap, base }) = state.compute_bindings.get(&(index as u32))
        else {
            return None;
        };
        return match heap.read(*base) {
            RawDescriptor::BufferUav { buffer } => {
                if buffer.current_state() != ResourceState::UnorderedAccess {
                    device.validation_error(format!(
                        "dispatch writes buffer {} outside UnorderedAccess state",
                        buffer.id
                    ));
                }
                Some(buffer)
            }
            _ => {
                device.validation_error(
                    "read-write storage buffer slot 0 holds no UAV descriptor".into(),
                );
                None
            }
        };
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn copy_buffer_texture(
    device: &RawDevice,
    buffer: &Arc<RawBuffer>,
    buffer_offset: u64,
    row_pitch: u32,
    texture: &Arc<RawTexture>,
    subresource: u32,
    origin: (u32, u32, u32),
    extent: (u32, u32, u32),
    to_texture: bool,
) {
    let desc = &texture.desc;
    let level = subresource % desc.level_count;
    let block = desc.format.block_dimension();
    let block_size = desc.format.texel_block_size() as usize;
    let (x, y, z) = origin;
    let (w, h, d) = extent;
    if w == 0 || h == 0 || d == 0 {
        device.validation_error("texture copy with an empty region".into());
        return;
    }
    if x + w > desc.level_width(level) || y + h > desc.level_height(level) || z + d > desc.level_depth(level)
    {
        device.validation_error(format!(
            "texture copy region out of bounds on texture {} level {level}",
            texture.id
        ));
        return;
    }
    let rows = h.div_ceil(block) as usize;
    let row_bytes = w.div_ceil(block) as usize * block_size;
    let level_pitch = desc.level_row_pitch(level) as usize;
    let level_rows = desc.level_row_count(level) as usize;
    let x_bytes = (x / block) as usize * block_size;
    let y_rows = (y / block) as usize;

    let needed = buffer_offset as usize
        + (d as usize - 1) * row_pitch as usize * rows
        + (rows - 1) * row_pitch as usize
        + row_bytes;
    if needed > buffer.size as usize {
        device.validation_error("texture copy exceeds buffer bounds".into());
        return;
    }

    let mut storage = buffer.storage();
    let mut slab = texture.slab(subresource);
    for slice in 0..d as usize {
        let slab_slice = (z as usize + slice) * level_pitch * level_rows;
        let buffer_slice = buffer_offset as usize + slice * row_pitch as usize * rows;
        for row in 0..rows {
            let slab_at = slab_slice + (y_rows + row) * level_pitch + x_bytes;
            let buffer_at = buffer_slice + row * row_pitch as usize;
            if to_texture {
                let (src, dst) =
                    (&storage[buffer_at..buffer_at + row_bytes], &mut slab[slab_at..slab_at + row_bytes]);
                dst.copy_from_slice(src);
            } else {
                let row_data = slab[slab_at..slab_at + row_bytes].to_vec();
                storage[buffer_at..buffer_at + row_bytes].copy_from_slice(&row_data);
            }
        }
    }
}

fn copy_texture_texture(
    device: &RawDevice,
    src: &Arc<RawTexture>,
    src_subresource: u32,
    src_origin: (u32, u32, u32),
    dst: &Arc<RawTexture>,
    dst_subresource: u32,
    dst_origin: (u32, u32, u32),
    extent: (u32, u32, u32),
) {
    let src_level = src_subresource % src.desc.level_count;
    let dst_level = dst_subresource % dst.desc.level_count;
    let block = src.desc.format.block_dimension();
    let block_size = src.desc.format.texel_block_size() as usize;
    if src.desc.format.texel_block_size() != dst.desc.format.texel_block_size() {
        device.validation_error("texture copy between incompatible formats".into());
        return;
    }
    let (w, h, d) = extent;
    if src_origin.0 + w > src.desc.level_width(src_level)
        || src_origin.1 + h > src.desc.level_height(src_level)
        || src_origin.2 + d > src.desc.level_depth(src_level)
        || dst_origin.0 + w > dst.desc.level_width(dst_level)
        || dst_origin.1 + h > dst.desc.level_height(dst_level)
        || dst_origin.2 + d > dst.desc.level_depth(dst_level)
    {
        device.validation_error("texture copy region out of bounds".into());
        return;
    }
    let rows = h.div_ceil(block) as usize;
    let row_bytes = w.div_ceil(block) as usize * block_size;
    let src_pitch = src.desc.level_row_pitch(src_level) as usize;
    let src_rows = src.desc.level_row_count(src_level) as usize;
    let dst_pitch = dst.desc.level_row_pitch(dst_level) as usize;
    let dst_rows = dst.desc.level_row_count(dst_level) as usize;

    // Copy through an intermediate so aliasing sub-resources stay sound.
    let mut staged = Vec::with_capacity(rows * row_bytes * d as usize);
    {
        let slab = src.slab(src_subresource);
        for slice in 0..d as usize {
            let slice_at = (src_origin.2 as usize + slice) * src_pitch * src_rows;
            for row in 0..rows {
                let at = slice_at
                    + ((src_origin.1 / block) as usize + row) * src_pitch
                    + (src_origin.0 / block) as usize * block_size;
                staged.extend_from_slice(&slab[at..at + row_bytes]);
            }
        }
    }
    let mut slab = dst.slab(dst_subresource);
    for slice in 0..d as usize {
        let slice_at = (dst_origin.2 as usize + slice) * dst_pitch * dst_rows;
        for row in 0..rows {
            let at = slice_at
                + ((dst_origin.1 / block) as usize + row) * dst_pitch
                + (dst_origin.0 / block) as usize * block_size;
            let staged_at = (slice * rows + row) * row_bytes;
            slab[at..at + row_bytes].copy_from_slice(&staged[staged_at..staged_at + row_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SampleCount, TextureType, TextureUsage};

    use super::super::resource::{HeapKind, RawTextureDesc};

    fn test_texture(device: &RawDevice, w: u32, h: u32, state: ResourceState) -> Arc<RawTexture> {
        RawTexture::new(
            device,
            RawTextureDesc {
                texture_type: TextureType::D2,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET,
                width: w,
                height: h,
                depth: 1,
                layer_count: 1,
                level_count: 1,
                sample_count: SampleCount::One,
            },
            state,
        )
    }

    #[test]
    fn buffer_copy_moves_bytes() {
        let device = RawDevice::new(true, 0);
        let src = RawBuffer::new(&device, 16, HeapKind::Upload);
        let dst = RawBuffer::new(&device, 16, HeapKind::Readback);
        src.storage().copy_from_slice(&[7u8; 16]);
        let mut list = RawCommandList::new();
        list.push(RawCommand::CopyBufferRegion {
            src: Arc::clone(&src),
            src_offset: 4,
            dst: Arc::clone(&dst),
            dst_offset: 0,
            size: 8,
        });
        list.close();
        device.execute_command_list(&mut list);
        assert!(device.take_validation_messages().is_empty());
        assert_eq!(&dst.storage()[0..8], &[7u8; 8]);
    }

    #[test]
    fn transition_mismatch_is_reported() {
        let device = RawDevice::new(true, 0);
        let texture = test_texture(&device, 4, 4, ResourceState::AllShaderResource);
        let mut list = RawCommandList::new();
        list.push(RawCommand::Transition {
            target: BarrierTarget::TextureSubresource(Arc::clone(&texture), 0),
            before: ResourceState::RenderTarget,
            after: ResourceState::Present,
        });
        list.close();
        device.execute_command_list(&mut list);
        let messages = device.take_validation_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("expected before-state"));
    }

    #[test]
    fn clear_outside_render_target_state_is_reported() {
        let device = RawDevice::new(true, 0);
        let texture = test_texture(&device, 4, 4, ResourceState::AllShaderResource);
        let mut list = RawCommandList::new();
        list.push(RawCommand::ClearRenderTarget {
            texture: Arc::clone(&texture),
            subresource: 0,
            color: [0.0, 0.0, 0.0, 1.0],
        });
        list.close();
        device.execute_command_list(&mut list);
        assert_eq!(device.take_validation_messages().len(), 1);
    }

    #[test]
    fn clear_fills_the_subresource() {
        let device = RawDevice::new(true, 0);
        let texture = test_texture(&device, 2, 2, ResourceState::RenderTarget);
        let mut list = RawCommandList::new();
        list.push(RawCommand::ClearRenderTarget {
            texture: Arc::clone(&texture),
            subresource: 0,
            color: [1.0, 0.0, 0.0, 1.0],
        });
        list.close();
        device.execute_command_list(&mut list);
        assert!(device.take_validation_messages().is_empty());
        let slab = texture.slab(0);
        assert_eq!(&slab[0..4], &[255, 0, 0, 255]);
        assert_eq!(&slab[12..16], &[255, 0, 0, 255]);
    }

    #[test]
    fn partial_buffer_to_texture_copy_lands_in_region() {
        let device = RawDevice::new(true, 0);
        let texture = test_texture(&device, 4, 4, ResourceState::CopyDest);
        let buffer = RawBuffer::new(&device, 256, HeapKind::Upload);
        buffer.storage()[..8].copy_from_slice(&[9u8; 8]);
        let mut list = RawCommandList::new();
        list.push(RawCommand::CopyBufferToTexture {
            buffer: Arc::clone(&buffer),
            buffer_offset: 0,
            row_pitch: 8,
            texture: Arc::clone(&texture),
            subresource: 0,
            x: 2,
            y: 1,
            z: 0,
            w: 2,
            h: 1,
            d: 1,
        });
        list.close();
        device.execute_command_list(&mut list);
        assert!(device.take_validation_messages().is_empty());
        let slab = texture.slab(0);
        // Row 1 starts at 16 bytes; texels (2,1) and (3,1) at byte 24..32.
        assert_eq!(&slab[24..32], &[9u8; 8]);
        assert_eq!(&slab[16..24], &[0u8; 8]);
    }
}
