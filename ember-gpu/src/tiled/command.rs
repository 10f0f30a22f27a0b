//! Command buffers, passes, and the binding model.
//!
//! A command buffer is acquired from the device pool, stamped with fresh
//! shader-visible heaps, recorded on a single thread, and consumed by
//! `submit`. Bind calls stage descriptors into per-stage slot arrays and set
//! dirty flags; the flush before each draw or dispatch copies the dirty
//! groups into the shader-visible heaps and binds the resulting tables.
//! Passes borrow the command buffer mutably, so pass nesting and
//! use-after-submit are compile errors rather than runtime assertions.

use std::array;
use std::sync::Arc;

use log::{error, warn};

use crate::error::Result;
use crate::{
    BufferBinding, BufferRegion, ColorAttachmentInfo, DepthStencilAttachmentInfo,
    IndexElementSize, LoadOp, Rect, StorageBufferReadWriteBinding,
    StorageTextureReadWriteBinding, TextureSamplerBinding, TextureTransferInfo, TextureRegion,
    TextureLocation, TransferBufferLocation, Viewport, MAX_STORAGE_BUFFERS_PER_STAGE,
    MAX_STORAGE_TEXTURES_PER_STAGE, MAX_TEXTURE_SAMPLERS_PER_STAGE,
    MAX_UNIFORM_BUFFERS_PER_STAGE,
};

use super::descriptor::{CpuDescriptor, GpuDescriptorHeap};
use super::fence::Fence;
use super::native::list::{RawCommand, RawCommandList};
use super::native::pipeline::UniformStage;
use super::native::resource::{HeapKind, RawBuffer, ResourceState};
use super::pipeline::{ComputePipeline, GraphicsPipeline, ResourceCounts, SamplerInner, StageRootIndices};
use super::resource::{Buffer, ConcreteBuffer, ConcreteTexture, Texture};
use super::state;
use super::swapchain::WindowData;
use super::uniform::{self, UniformBuffer, UNIFORM_BUFFER_POOL_SIZE};
use super::DeviceShared;

/// Texture-copy alignment contract of the tiled backend: row pitch rounds up
/// to 256 bytes, buffer offsets to 512.
pub(crate) const TEXTURE_ROW_PITCH_ALIGNMENT: u32 = 256;
pub(crate) const TEXTURE_OFFSET_ALIGNMENT: u64 = 512;

type SamplerSlot = Option<(Arc<SamplerInner>, Arc<ConcreteTexture>)>;

pub(crate) struct StageBindings {
    samplers: [SamplerSlot; MAX_TEXTURE_SAMPLERS_PER_STAGE],
    storage_textures: [Option<Arc<ConcreteTexture>>; MAX_STORAGE_TEXTURES_PER_STAGE],
    storage_buffers: [Option<Arc<ConcreteBuffer>>; MAX_STORAGE_BUFFERS_PER_STAGE],
    samplers_dirty: bool,
    storage_textures_dirty: bool,
    storage_buffers_dirty: bool,
}

impl StageBindings {
    fn new() -> Self {
        Self {
            samplers: array::from_fn(|_| None),
            storage_textures: array::from_fn(|_| None),
            storage_buffers: array::from_fn(|_| None),
            samplers_dirty: false,
            storage_textures_dirty: false,
            storage_buffers_dirty: false,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

pub(crate) struct ComputeBindings {
    read_storage_textures: [Option<Arc<ConcreteTexture>>; MAX_STORAGE_TEXTURES_PER_STAGE],
    read_storage_buffers: [Option<Arc<ConcreteBuffer>>; MAX_STORAGE_BUFFERS_PER_STAGE],
    write_storage_textures: Vec<(Arc<ConcreteTexture>, u32)>,
    write_storage_buffers: Vec<(Arc<ConcreteBuffer>, crate::BufferUsage)>,
    read_textures_dirty: bool,
    read_buffers_dirty: bool,
    write_dirty: bool,
}

impl ComputeBindings {
    fn new() -> Self {
        Self {
            read_storage_textures: array::from_fn(|_| None),
            read_storage_buffers: array::from_fn(|_| None),
            write_storage_textures: Vec::new(),
            write_storage_buffers: Vec::new(),
            read_textures_dirty: false,
            read_buffers_dirty: false,
            write_dirty: false,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

pub(crate) struct UniformSlots {
    slots: [Option<usize>; MAX_UNIFORM_BUFFERS_PER_STAGE],
    dirty: [bool; MAX_UNIFORM_BUFFERS_PER_STAGE],
}

impl UniformSlots {
    fn new() -> Self {
        Self { slots: [None; MAX_UNIFORM_BUFFERS_PER_STAGE], dirty: [false; MAX_UNIFORM_BUFFERS_PER_STAGE] }
    }
}

pub(crate) struct UniformState {
    vertex: UniformSlots,
    fragment: UniformSlots,
    compute: UniformSlots,
    /// Every wrapper this command buffer filled; returned to the device pool
    /// at retirement, not before.
    pub(crate) used: Vec<UniformBuffer>,
}

impl UniformState {
    fn new() -> Self {
        Self {
            vertex: UniformSlots::new(),
            fragment: UniformSlots::new(),
            compute: UniformSlots::new(),
            used: Vec::new(),
        }
    }

    fn stage(&mut self, stage: UniformStage) -> &mut UniformSlots {
        match stage {
            UniformStage::Vertex => &mut self.vertex,
            UniformStage::Fragment => &mut self.fragment,
            UniformStage::Compute => &mut self.compute,
        }
    }
}

/// Duplicate-free (by linear scan) lists of everything this command buffer
/// references, reference-counted until retirement.
#[derive(Default)]
pub(crate) struct TrackedResources {
    pub(crate) texture_subresources: Vec<(Arc<ConcreteTexture>, u32)>,
    pub(crate) buffers: Vec<Arc<ConcreteBuffer>>,
    pub(crate) samplers: Vec<Arc<SamplerInner>>,
    pub(crate) graphics_pipelines: Vec<GraphicsPipeline>,
    pub(crate) compute_pipelines: Vec<ComputePipeline>,
}

impl TrackedResources {
    pub(crate) fn track_texture_subresource(&mut self, texture: &Arc<ConcreteTexture>, sub: u32) {
        let seen = self
            .texture_subresources
            .iter()
            .any(|(tracked, tracked_sub)| Arc::ptr_eq(tracked, texture) && *tracked_sub == sub);
        if !seen {
            texture.subresources[sub as usize].add_ref();
            self.texture_subresources.push((Arc::clone(texture), sub));
        }
    }

    pub(crate) fn track_whole_texture(&mut self, texture: &Arc<ConcreteTexture>) {
        for sub in 0..texture.subresources.len() as u32 {
            self.track_texture_subresource(texture, sub);
        }
    }

    pub(crate) fn track_buffer(&mut self, buffer: &Arc<ConcreteBuffer>) {
        if !self.buffers.iter().any(|tracked| Arc::ptr_eq(tracked, buffer)) {
            buffer.add_ref();
            self.buffers.push(Arc::clone(buffer));
        }
    }

    fn track_sampler(&mut self, sampler: &Arc<SamplerInner>) {
        if !self.samplers.iter().any(|tracked| Arc::ptr_eq(tracked, sampler)) {
            self.samplers.push(Arc::clone(sampler));
        }
    }

    fn track_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline) {
        if !self
            .graphics_pipelines
            .iter()
            .any(|tracked| Arc::ptr_eq(&tracked.inner, &pipeline.inner))
        {
            self.graphics_pipelines.push(pipeline.clone());
        }
    }

    fn track_compute_pipeline(&mut self, pipeline: &ComputePipeline) {
        if !self
            .compute_pipelines
            .iter()
            .any(|tracked| Arc::ptr_eq(&tracked.inner, &pipeline.inner))
        {
            self.compute_pipelines.push(pipeline.clone());
        }
    }

    /// Drops the in-flight references. Called exactly once, at retirement.
    pub(crate) fn release_all(&mut self) {
        for (texture, sub) in self.texture_subresources.drain(..) {
            texture.subresources[sub as usize].sub_ref();
        }
        for buffer in self.buffers.drain(..) {
            buffer.sub_ref();
        }
        self.samplers.clear();
        self.graphics_pipelines.clear();
        self.compute_pipelines.clear();
    }
}

pub(crate) struct PresentEntry {
    pub(crate) window: Arc<WindowData>,
    pub(crate) back_buffer_index: u32,
    pub(crate) texture: Arc<ConcreteTexture>,
}

/// A deferred download fix-up: rows were copied into an aligned temporary at
/// execution; retirement repacks them into the caller's transfer layout.
pub(crate) struct TextureDownload {
    pub(crate) temporary: Arc<RawBuffer>,
    pub(crate) destination: Arc<ConcreteBuffer>,
    pub(crate) destination_offset: u64,
    pub(crate) temporary_pitch: u32,
    pub(crate) destination_pitch: u32,
    pub(crate) destination_rows_per_slice: u32,
    pub(crate) row_bytes: u32,
    pub(crate) rows: u32,
    pub(crate) slices: u32,
}

/// The pooled interior of a command buffer.
pub(crate) struct CommandBufferCore {
    pub(crate) list: RawCommandList,
    pub(crate) view_heap: Option<GpuDescriptorHeap>,
    pub(crate) sampler_heap: Option<GpuDescriptorHeap>,
    vertex: StageBindings,
    fragment: StageBindings,
    compute: ComputeBindings,
    graphics_pipeline: Option<GraphicsPipeline>,
    compute_pipeline: Option<ComputePipeline>,
    pub(crate) uniforms: UniformState,
    pub(crate) tracked: TrackedResources,
    pub(crate) present_entries: Vec<PresentEntry>,
    pub(crate) texture_downloads: Vec<TextureDownload>,
    /// Realignment temporaries; alive until retirement.
    pub(crate) temporaries: Vec<Arc<RawBuffer>>,
    pub(crate) auto_release_fence: bool,
}

impl CommandBufferCore {
    pub(crate) fn new() -> Self {
        Self {
            list: RawCommandList::new(),
            view_heap: None,
            sampler_heap: None,
            vertex: StageBindings::new(),
            fragment: StageBindings::new(),
            compute: ComputeBindings::new(),
            graphics_pipeline: None,
            compute_pipeline: None,
            uniforms: UniformState::new(),
            tracked: TrackedResources::default(),
            present_entries: Vec::new(),
            texture_downloads: Vec::new(),
            temporaries: Vec::new(),
            auto_release_fence: true,
        }
    }

    pub(crate) fn reset_for_reuse(&mut self) {
        self.list.reset();
        self.vertex.clear();
        self.fragment.clear();
        self.compute.clear();
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.uniforms = UniformState::new();
        self.present_entries.clear();
        self.texture_downloads.clear();
        self.temporaries.clear();
        self.auto_release_fence = true;
    }
}

/// A transient recording context. Consumed by submission, so reuse after
/// submit does not compile.
pub struct CommandBuffer {
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) core: CommandBufferCore,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("present_entries", &self.core.present_entries.len())
            .finish()
    }
}

impl CommandBuffer {
    /// Submits the recorded commands and presents every acquired swapchain
    /// texture. The fence is released automatically at retirement.
    pub fn submit(self) -> Result<()> {
        let device = Arc::clone(&self.device);
        super::submit_command_buffer(&device, self, false)?;
        Ok(())
    }

    /// As [`submit`](Self::submit), but transfers the fence to the caller.
    pub fn submit_and_acquire_fence(self) -> Result<Fence> {
        let device = Arc::clone(&self.device);
        let fence = super::submit_command_buffer(&device, self, true)?;
        Ok(Fence::new(fence.expect("fence requested from submit")))
    }

    pub fn insert_debug_label(&mut self, text: &str) {
        self.core.list.push(RawCommand::DebugLabel(text.to_owned()));
    }

    pub fn push_debug_group(&mut self, name: &str) {
        self.core.list.push(RawCommand::PushDebugGroup(name.to_owned()));
    }

    pub fn pop_debug_group(&mut self) {
        self.core.list.push(RawCommand::PopDebugGroup);
    }

    pub fn push_vertex_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.push_uniform_data(UniformStage::Vertex, slot, data);
    }

    pub fn push_fragment_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.push_uniform_data(UniformStage::Fragment, slot, data);
    }

    pub fn push_compute_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.push_uniform_data(UniformStage::Compute, slot, data);
    }

    pub(crate) fn push_uniform_data(&mut self, stage: UniformStage, slot: u32, data: &[u8]) {
        if slot as usize >= MAX_UNIFORM_BUFFERS_PER_STAGE {
            error!("uniform slot {slot} out of range");
            return;
        }
        if data.is_empty() || data.len() as u64 > UNIFORM_BUFFER_POOL_SIZE {
            error!("uniform push of {} bytes rejected", data.len());
            return;
        }
        let block = uniform::align_block(data.len() as u32);
        let device = Arc::clone(&self.device);
        let uniforms = &mut self.core.uniforms;

        let current = uniforms.stage(stage).slots[slot as usize];
        let index = match current {
            Some(index) if uniforms.used[index].has_room(block) => index,
            _ => {
                // Either no wrapper yet, or the current one is full; the full
                // one stays in the used list until retirement.
                let wrapper = match uniform::acquire_uniform_buffer(&device) {
                    Ok(wrapper) => wrapper,
                    Err(err) => {
                        error!("failed to acquire a uniform buffer: {err}");
                        return;
                    }
                };
                uniforms.used.push(wrapper);
                let index = uniforms.used.len() - 1;
                uniforms.stage(stage).slots[slot as usize] = Some(index);
                index
            }
        };
        uniforms.used[index].push(data);
        uniforms.stage(stage).dirty[slot as usize] = true;
    }

    /// Ensures a wrapper exists for every uniform slot the pipeline declares
    /// and flags the slots for rebinding.
    fn ensure_uniform_wrappers(&mut self, stage: UniformStage, declared: u32) {
        let device = Arc::clone(&self.device);
        let uniforms = &mut self.core.uniforms;
        for slot in 0..declared as usize {
            if uniforms.stage(stage).slots[slot].is_none() {
                match uniform::acquire_uniform_buffer(&device) {
                    Ok(wrapper) => {
                        uniforms.used.push(wrapper);
                        let index = uniforms.used.len() - 1;
                        uniforms.stage(stage).slots[slot] = Some(index);
                    }
                    Err(err) => {
                        error!("failed to acquire a uniform buffer: {err}");
                        continue;
                    }
                }
            }
            uniforms.stage(stage).dirty[slot] = true;
        }
    }

    /// Copies one dirty group's staging descriptors into a contiguous range
    /// of the shader-visible heap and returns the range's base slot.
    fn stage_descriptor_table<'a>(
        heap: &mut GpuDescriptorHeap,
        descriptors: impl Iterator<Item = Option<&'a CpuDescriptor>>,
        count: u32,
    ) -> Option<u32> {
        let base = heap.reserve(count)?;
        for (offset, descriptor) in descriptors.take(count as usize).enumerate() {
            let Some(descriptor) = descriptor else { continue };
            let Some(staging_heap) = descriptor.heap() else { continue };
            heap.raw().copy_from(base + offset as u32, staging_heap, descriptor.index());
        }
        Some(base)
    }

    fn bind_uniform_tables(&mut self, stage: UniformStage, declared: u32, base_index: i32, compute: bool) {
        if base_index < 0 {
            return;
        }
        let uniforms = &mut self.core.uniforms;
        for slot in 0..declared as usize {
            if !uniforms.stage(stage).dirty[slot] {
                continue;
            }
            let Some(index) = uniforms.stage(stage).slots[slot] else { continue };
            let wrapper = &uniforms.used[index];
            let parameter = (base_index + slot as i32) as u32;
            let command = if compute {
                RawCommand::SetComputeRootConstantBuffer {
                    parameter,
                    address: wrapper.draw_address(),
                    buffer: Arc::clone(&wrapper.buffer.raw),
                    offset: wrapper.draw_offset as u64,
                }
            } else {
                RawCommand::SetGraphicsRootConstantBuffer {
                    parameter,
                    address: wrapper.draw_address(),
                    buffer: Arc::clone(&wrapper.buffer.raw),
                    offset: wrapper.draw_offset as u64,
                }
            };
            self.core.list.push(command);
            uniforms.stage(stage).dirty[slot] = false;
        }
    }

    fn flush_stage_bindings(
        &mut self,
        stage: UniformStage,
        counts: ResourceCounts,
        indices: StageRootIndices,
    ) {
        // Samplers come in pairs: the sampler table in the sampler heap and
        // the sampled-texture SRV table in the view heap.
        let bindings = match stage {
            UniformStage::Vertex => &self.core.vertex,
            _ => &self.core.fragment,
        };
        if bindings.samplers_dirty && counts.samplers > 0 {
            let sampler_descriptors: Vec<Option<&CpuDescriptor>> = bindings
                .samplers
                .iter()
                .map(|slot| slot.as_ref().map(|(sampler, _)| &sampler.descriptor))
                .collect();
            let texture_descriptors: Vec<Option<&CpuDescriptor>> = bindings
                .samplers
                .iter()
                .map(|slot| slot.as_ref().and_then(|(_, texture)| texture.srv.as_ref()))
                .collect();
            let sampler_heap = self.core.sampler_heap.as_mut().expect("heaps set at acquisition");
            let sampler_base =
                Self::stage_descriptor_table(sampler_heap, sampler_descriptors.into_iter(), counts.samplers);
            let sampler_heap_raw = Arc::clone(sampler_heap.raw());
            let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
            let texture_base =
                Self::stage_descriptor_table(view_heap, texture_descriptors.into_iter(), counts.samplers);
            let view_heap_raw = Arc::clone(view_heap.raw());
            if let (Some(base), true) = (sampler_base, indices.sampler_table >= 0) {
                self.core.list.push(RawCommand::SetGraphicsRootDescriptorTable {
                    parameter: indices.sampler_table as u32,
                    heap: sampler_heap_raw,
                    base,
                });
            }
            if let (Some(base), true) = (texture_base, indices.sampler_texture_table >= 0) {
                self.core.list.push(RawCommand::SetGraphicsRootDescriptorTable {
                    parameter: indices.sampler_texture_table as u32,
                    heap: view_heap_raw,
                    base,
                });
            }
        }

        let bindings = match stage {
            UniformStage::Vertex => &self.core.vertex,
            _ => &self.core.fragment,
        };
        if bindings.storage_textures_dirty && counts.storage_textures > 0 {
            let descriptors: Vec<Option<&CpuDescriptor>> = bindings
                .storage_textures
                .iter()
                .map(|slot| slot.as_ref().and_then(|texture| texture.srv.as_ref()))
                .collect();
            let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
            let base =
                Self::stage_descriptor_table(view_heap, descriptors.into_iter(), counts.storage_textures);
            let heap = Arc::clone(view_heap.raw());
            if let (Some(base), true) = (base, indices.storage_texture_table >= 0) {
                self.core.list.push(RawCommand::SetGraphicsRootDescriptorTable {
                    parameter: indices.storage_texture_table as u32,
                    heap,
                    base,
                });
            }
        }

        let bindings = match stage {
            UniformStage::Vertex => &self.core.vertex,
            _ => &self.core.fragment,
        };
        if bindings.storage_buffers_dirty && counts.storage_buffers > 0 {
            let descriptors: Vec<Option<&CpuDescriptor>> = bindings
                .storage_buffers
                .iter()
                .map(|slot| slot.as_ref().and_then(|buffer| buffer.srv.as_ref()))
                .collect();
            let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
            let base =
                Self::stage_descriptor_table(view_heap, descriptors.into_iter(), counts.storage_buffers);
            let heap = Arc::clone(view_heap.raw());
            if let (Some(base), true) = (base, indices.storage_buffer_table >= 0) {
                self.core.list.push(RawCommand::SetGraphicsRootDescriptorTable {
                    parameter: indices.storage_buffer_table as u32,
                    heap,
                    base,
                });
            }
        }

        match stage {
            UniformStage::Vertex => {
                self.core.vertex.samplers_dirty = false;
                self.core.vertex.storage_textures_dirty = false;
                self.core.vertex.storage_buffers_dirty = false;
            }
            _ => {
                self.core.fragment.samplers_dirty = false;
                self.core.fragment.storage_textures_dirty = false;
                self.core.fragment.storage_buffers_dirty = false;
            }
        }
        self.bind_uniform_tables(stage, counts.uniform_buffers, indices.uniform_base, false);
    }

    fn flush_graphics_bindings(&mut self) {
        let Some(pipeline) = self.core.graphics_pipeline.clone() else {
            error!("draw recorded without a bound graphics pipeline");
            return;
        };
        self.flush_stage_bindings(
            UniformStage::Vertex,
            pipeline.inner.vertex_counts,
            pipeline.inner.root.vertex,
        );
        self.flush_stage_bindings(
            UniformStage::Fragment,
            pipeline.inner.fragment_counts,
            pipeline.inner.root.fragment,
        );
    }

    fn flush_compute_bindings(&mut self) {
        let Some(pipeline) = self.core.compute_pipeline.clone() else {
            error!("dispatch recorded without a bound compute pipeline");
            return;
        };
        let inner = &pipeline.inner;

        if self.core.compute.read_textures_dirty && inner.num_readonly_storage_textures > 0 {
            let descriptors: Vec<Option<&CpuDescriptor>> = self
                .core
                .compute
                .read_storage_textures
                .iter()
                .map(|slot| slot.as_ref().and_then(|texture| texture.srv.as_ref()))
                .collect();
            let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
            let base = Self::stage_descriptor_table(
                view_heap,
                descriptors.into_iter(),
                inner.num_readonly_storage_textures,
            );
            let heap = Arc::clone(view_heap.raw());
            if let (Some(base), true) = (base, inner.root.read_texture_table >= 0) {
                self.core.list.push(RawCommand::SetComputeRootDescriptorTable {
                    parameter: inner.root.read_texture_table as u32,
                    heap,
                    base,
                });
            }
            self.core.compute.read_textures_dirty = false;
        }

        if self.core.compute.read_buffers_dirty && inner.num_readonly_storage_buffers > 0 {
            let descriptors: Vec<Option<&CpuDescriptor>> = self
                .core
                .compute
                .read_storage_buffers
                .iter()
                .map(|slot| slot.as_ref().and_then(|buffer| buffer.srv.as_ref()))
                .collect();
            let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
            let base = Self::stage_descriptor_table(
                view_heap,
                descriptors.into_iter(),
                inner.num_readonly_storage_buffers,
            );
            let heap = Arc::clone(view_heap.raw());
            if let (Some(base), true) = (base, inner.root.read_buffer_table >= 0) {
                self.core.list.push(RawCommand::SetComputeRootDescriptorTable {
                    parameter: inner.root.read_buffer_table as u32,
                    heap,
                    base,
                });
            }
            self.core.compute.read_buffers_dirty = false;
        }

        if self.core.compute.write_dirty {
            if inner.num_readwrite_storage_textures > 0 {
                let descriptors: Vec<Option<&CpuDescriptor>> = self
                    .core
                    .compute
                    .write_storage_textures
                    .iter()
                    .map(|(texture, sub)| texture.subresources[*sub as usize].uav.as_ref())
                    .collect();
                let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
                let base = Self::stage_descriptor_table(
                    view_heap,
                    descriptors.into_iter(),
                    inner.num_readwrite_storage_textures,
                );
                let heap = Arc::clone(view_heap.raw());
                if let (Some(base), true) = (base, inner.root.write_texture_table >= 0) {
                    self.core.list.push(RawCommand::SetComputeRootDescriptorTable {
                        parameter: inner.root.write_texture_table as u32,
                        heap,
                        base,
                    });
                }
            }
            if inner.num_readwrite_storage_buffers > 0 {
                let descriptors: Vec<Option<&CpuDescriptor>> = self
                    .core
                    .compute
                    .write_storage_buffers
                    .iter()
                    .map(|(buffer, _)| buffer.uav.as_ref())
                    .collect();
                let view_heap = self.core.view_heap.as_mut().expect("heaps set at acquisition");
                let base = Self::stage_descriptor_table(
                    view_heap,
                    descriptors.into_iter(),
                    inner.num_readwrite_storage_buffers,
                );
                let heap = Arc::clone(view_heap.raw());
                if let (Some(base), true) = (base, inner.root.write_buffer_table >= 0) {
                    self.core.list.push(RawCommand::SetComputeRootDescriptorTable {
                        parameter: inner.root.write_buffer_table as u32,
                        heap,
                        base,
                    });
                }
            }
            self.core.compute.write_dirty = false;
        }

        self.bind_uniform_tables(
            UniformStage::Compute,
            inner.num_uniform_buffers,
            inner.root.uniform_base,
            true,
        );
    }

    /// Begins a render pass. Attachments are cycled when requested (never
    /// under `LoadOp::Load`), transitioned for writing, and cleared per their
    /// load ops. Viewport and scissor default to the smallest attachment.
    pub fn begin_render_pass<'a>(
        &'a mut self,
        color_attachments: &[ColorAttachmentInfo<'_>],
        depth_stencil_attachment: Option<&DepthStencilAttachmentInfo<'_>>,
    ) -> Result<RenderPass<'a>> {
        let device = Arc::clone(&self.device);
        let mut color_records = Vec::with_capacity(color_attachments.len());
        let mut native_targets = Vec::with_capacity(color_attachments.len());
        let mut min_extent = (u32::MAX, u32::MAX);

        for info in color_attachments {
            let container = &info.texture.container;
            let cycle = info.cycle && info.load_op != LoadOp::Load;
            let layer = match container.info.texture_type {
                crate::TextureType::D3 => 0,
                _ => info.layer_or_depth_plane,
            };
            let (texture, sub) = state::prepare_texture_subresource_for_write(
                &device,
                &mut self.core.list,
                container,
                layer,
                info.mip_level,
                cycle,
                ResourceState::RenderTarget,
            )?;
            if info.load_op == LoadOp::Clear {
                self.core.list.push(RawCommand::ClearRenderTarget {
                    texture: Arc::clone(&texture.raw),
                    subresource: sub,
                    color: info.clear_color,
                });
            }
            self.core.tracked.track_texture_subresource(&texture, sub);
            min_extent.0 = min_extent.0.min(texture.raw.desc.level_width(info.mip_level));
            min_extent.1 = min_extent.1.min(texture.raw.desc.level_height(info.mip_level));
            native_targets.push((Arc::clone(&texture.raw), sub, container.info.format));
            color_records.push(AttachmentRecord { texture, subresource: sub, used: ResourceState::RenderTarget });
        }

        let mut depth_record = None;
        let mut native_depth = None;
        if let Some(info) = depth_stencil_attachment {
            let container = &info.texture.container;
            let cycle = info.cycle && info.load_op != LoadOp::Load;
            let (texture, sub) = state::prepare_texture_subresource_for_write(
                &device,
                &mut self.core.list,
                container,
                0,
                0,
                cycle,
                ResourceState::DepthWrite,
            )?;
            let clear_depth = info.load_op == LoadOp::Clear;
            let clear_stencil = info.stencil_load_op == LoadOp::Clear;
            if clear_depth || clear_stencil {
                self.core.list.push(RawCommand::ClearDepthStencil {
                    texture: Arc::clone(&texture.raw),
                    subresource: sub,
                    depth: info.clear_depth,
                    stencil: info.clear_stencil,
                    clear_depth,
                    clear_stencil,
                });
            }
            self.core.tracked.track_texture_subresource(&texture, sub);
            min_extent.0 = min_extent.0.min(texture.raw.desc.width);
            min_extent.1 = min_extent.1.min(texture.raw.desc.height);
            native_depth = Some((Arc::clone(&texture.raw), sub));
            depth_record =
                Some(AttachmentRecord { texture, subresource: sub, used: ResourceState::DepthWrite });
        }

        self.core.list.push(RawCommand::SetRenderTargets {
            colors: native_targets,
            depth: native_depth,
        });
        if min_extent.0 != u32::MAX {
            self.core.list.push(RawCommand::SetViewport(Viewport {
                x: 0.0,
                y: 0.0,
                w: min_extent.0 as f32,
                h: min_extent.1 as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }));
            self.core.list.push(RawCommand::SetScissor(Rect {
                x: 0,
                y: 0,
                w: min_extent.0 as i32,
                h: min_extent.1 as i32,
            }));
        }

        Ok(RenderPass { cb: self, color: color_records, depth: depth_record, ended: false })
    }

    /// Begins a compute pass. Read-write bindings are fixed for the pass:
    /// cycled when requested, transitioned to unordered access, and bound as
    /// UAV tables at the first dispatch.
    pub fn begin_compute_pass<'a>(
        &'a mut self,
        storage_texture_bindings: &[StorageTextureReadWriteBinding<'_>],
        storage_buffer_bindings: &[StorageBufferReadWriteBinding<'_>],
    ) -> Result<ComputePass<'a>> {
        let device = Arc::clone(&self.device);
        for binding in storage_texture_bindings {
            let (texture, sub) = state::prepare_texture_subresource_for_write(
                &device,
                &mut self.core.list,
                &binding.texture.container,
                binding.layer,
                binding.mip_level,
                binding.cycle,
                ResourceState::UnorderedAccess,
            )?;
            self.core.tracked.track_texture_subresource(&texture, sub);
            self.core.compute.write_storage_textures.push((texture, sub));
        }
        for binding in storage_buffer_bindings {
            let buffer = state::prepare_buffer_for_write(
                &device,
                &mut self.core.list,
                &binding.buffer.container,
                binding.cycle,
                ResourceState::UnorderedAccess,
            )?;
            self.core.tracked.track_buffer(&buffer);
            self.core
                .compute
                .write_storage_buffers
                .push((buffer, binding.buffer.container.usage));
        }
        self.core.compute.write_dirty = true;
        Ok(ComputePass { cb: self, read_reverts: Vec::new(), ended: false })
    }

    /// Begins a copy pass for uploads, downloads, and resource-to-resource
    /// copies.
    pub fn begin_copy_pass(&mut self) -> CopyPass<'_> {
        CopyPass { cb: self, ended: false }
    }
}

struct AttachmentRecord {
    texture: Arc<ConcreteTexture>,
    subresource: u32,
    used: ResourceState,
}

/// A render pass: graphics state, binds, and draws against a fixed set of
/// attachments.
pub struct RenderPass<'a> {
    cb: &'a mut CommandBuffer,
    color: Vec<AttachmentRecord>,
    depth: Option<AttachmentRecord>,
    ended: bool,
}

impl<'a> RenderPass<'a> {
    pub fn bind_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline) {
        let inner = &pipeline.inner;
        self.cb.core.list.push(RawCommand::SetGraphicsRootSignature(Arc::clone(&inner.root.signature)));
        self.cb.core.list.push(RawCommand::SetGraphicsPipeline(Arc::clone(&inner.raw)));
        self.cb.core.list.push(RawCommand::SetTopology(inner.topology));
        self.cb.core.list.push(RawCommand::SetBlendConstants(inner.blend_constants));
        self.cb.core.list.push(RawCommand::SetStencilReference(inner.stencil_reference));
        self.cb.core.vertex.samplers_dirty = true;
        self.cb.core.vertex.storage_textures_dirty = true;
        self.cb.core.vertex.storage_buffers_dirty = true;
        self.cb.core.fragment.samplers_dirty = true;
        self.cb.core.fragment.storage_textures_dirty = true;
        self.cb.core.fragment.storage_buffers_dirty = true;
        self.cb.core.graphics_pipeline = Some(pipeline.clone());
        self.cb.core.tracked.track_graphics_pipeline(pipeline);
        self.cb
            .ensure_uniform_wrappers(UniformStage::Vertex, inner.vertex_counts.uniform_buffers);
        self.cb
            .ensure_uniform_wrappers(UniformStage::Fragment, inner.fragment_counts.uniform_buffers);
    }

    pub fn bind_vertex_buffers(&mut self, first_slot: u32, bindings: &[BufferBinding<'_>]) {
        let mut buffers = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let concrete = binding.buffer.container.active();
            self.cb.core.tracked.track_buffer(&concrete);
            buffers.push((Arc::clone(&concrete.raw), binding.offset));
        }
        self.cb.core.list.push(RawCommand::SetVertexBuffers { first_slot, buffers });
    }

    pub fn bind_index_buffer(&mut self, binding: &BufferBinding<'_>, element_size: IndexElementSize) {
        let concrete = binding.buffer.container.active();
        self.cb.core.tracked.track_buffer(&concrete);
        self.cb.core.list.push(RawCommand::SetIndexBuffer {
            buffer: Arc::clone(&concrete.raw),
            offset: binding.offset,
            format: element_size,
        });
    }

    fn bind_samplers(&mut self, stage: UniformStage, first_slot: u32, bindings: &[TextureSamplerBinding<'_>]) {
        for (offset, binding) in bindings.iter().enumerate() {
            let slot = first_slot as usize + offset;
            if slot >= MAX_TEXTURE_SAMPLERS_PER_STAGE {
                error!("texture-sampler slot {slot} out of range");
                break;
            }
            let texture = binding.texture.container.active();
            self.cb.core.tracked.track_whole_texture(&texture);
            self.cb.core.tracked.track_sampler(&binding.sampler.inner);
            let slots = match stage {
                UniformStage::Vertex => &mut self.cb.core.vertex,
                _ => &mut self.cb.core.fragment,
            };
            slots.samplers[slot] = Some((Arc::clone(&binding.sampler.inner), texture));
        }
        match stage {
            UniformStage::Vertex => self.cb.core.vertex.samplers_dirty = true,
            _ => self.cb.core.fragment.samplers_dirty = true,
        }
    }

    fn bind_storage_textures(&mut self, stage: UniformStage, first_slot: u32, textures: &[&Texture]) {
        for (offset, texture) in textures.iter().enumerate() {
            let slot = first_slot as usize + offset;
            if slot >= MAX_STORAGE_TEXTURES_PER_STAGE {
                error!("storage texture slot {slot} out of range");
                break;
            }
            let concrete = texture.container.active();
            self.cb.core.tracked.track_whole_texture(&concrete);
            let slots = match stage {
                UniformStage::Vertex => &mut self.cb.core.vertex,
                _ => &mut self.cb.core.fragment,
            };
            slots.storage_textures[slot] = Some(concrete);
        }
        match stage {
            UniformStage::Vertex => self.cb.core.vertex.storage_textures_dirty = true,
            _ => self.cb.core.fragment.storage_textures_dirty = true,
        }
    }

    fn bind_storage_buffers(&mut self, stage: UniformStage, first_slot: u32, buffers: &[&Buffer]) {
        for (offset, buffer) in buffers.iter().enumerate() {
            let slot = first_slot as usize + offset;
            if slot >= MAX_STORAGE_BUFFERS_PER_STAGE {
                error!("storage buffer slot {slot} out of range");
                break;
            }
            let concrete = buffer.container.active();
            self.cb.core.tracked.track_buffer(&concrete);
            let slots = match stage {
                UniformStage::Vertex => &mut self.cb.core.vertex,
                _ => &mut self.cb.core.fragment,
            };
            slots.storage_buffers[slot] = Some(concrete);
        }
        match stage {
            UniformStage::Vertex => self.cb.core.vertex.storage_buffers_dirty = true,
            _ => self.cb.core.fragment.storage_buffers_dirty = true,
        }
    }

    pub fn bind_vertex_samplers(&mut self, first_slot: u32, bindings: &[TextureSamplerBinding<'_>]) {
        self.bind_samplers(UniformStage::Vertex, first_slot, bindings);
    }

    pub fn bind_fragment_samplers(&mut self, first_slot: u32, bindings: &[TextureSamplerBinding<'_>]) {
        self.bind_samplers(UniformStage::Fragment, first_slot, bindings);
    }

    pub fn bind_vertex_storage_textures(&mut self, first_slot: u32, textures: &[&Texture]) {
        self.bind_storage_textures(UniformStage::Vertex, first_slot, textures);
    }

    pub fn bind_fragment_storage_textures(&mut self, first_slot: u32, textures: &[&Texture]) {
        self.bind_storage_textures(UniformStage::Fragment, first_slot, textures);
    }

    pub fn bind_vertex_storage_buffers(&mut self, first_slot: u32, buffers: &[&Buffer]) {
        self.bind_storage_buffers(UniformStage::Vertex, first_slot, buffers);
    }

    pub fn bind_fragment_storage_buffers(&mut self, first_slot: u32, buffers: &[&Buffer]) {
        self.bind_storage_buffers(UniformStage::Fragment, first_slot, buffers);
    }

    pub fn push_vertex_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.cb.push_uniform_data(UniformStage::Vertex, slot, data);
    }

    pub fn push_fragment_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.cb.push_uniform_data(UniformStage::Fragment, slot, data);
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) {
        self.cb.core.list.push(RawCommand::SetViewport(*viewport));
    }

    pub fn set_scissor(&mut self, scissor: &Rect) {
        self.cb.core.list.push(RawCommand::SetScissor(*scissor));
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.cb.core.list.push(RawCommand::SetBlendConstants(constants));
    }

    pub fn set_stencil_reference(&mut self, reference: u8) {
        self.cb.core.list.push(RawCommand::SetStencilReference(reference));
    }

    pub fn draw_primitives(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.cb.flush_graphics_bindings();
        self.cb.core.list.push(RawCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.cb.flush_graphics_bindings();
        self.cb.core.list.push(RawCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    pub fn draw_primitives_indirect(&mut self, buffer: &Buffer, offset: u64) {
        let stride = self.cb.device.indirect_signatures.draw;
        if offset + stride > buffer.size() {
            error!("indirect draw arguments exceed the argument buffer");
            return;
        }
        let concrete = buffer.container.active();
        self.cb.core.tracked.track_buffer(&concrete);
        self.cb.flush_graphics_bindings();
        self.cb.core.list.push(RawCommand::DrawIndirect {
            buffer: Arc::clone(&concrete.raw),
            offset,
            indexed: false,
        });
    }

    pub fn draw_indexed_indirect(&mut self, buffer: &Buffer, offset: u64) {
        let stride = self.cb.device.indirect_signatures.draw_indexed;
        if offset + stride > buffer.size() {
            error!("indexed indirect draw arguments exceed the argument buffer");
            return;
        }
        let concrete = buffer.container.active();
        self.cb.core.tracked.track_buffer(&concrete);
        self.cb.flush_graphics_bindings();
        self.cb.core.list.push(RawCommand::DrawIndirect {
            buffer: Arc::clone(&concrete.raw),
            offset,
            indexed: true,
        });
    }

    pub fn insert_debug_label(&mut self, text: &str) {
        self.cb.insert_debug_label(text);
    }

    fn end_impl(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        for record in self.color.drain(..) {
            state::transition_texture_to_default(
                &mut self.cb.core.list,
                &record.texture,
                record.subresource,
                record.used,
            );
        }
        if let Some(record) = self.depth.take() {
            state::transition_texture_to_default(
                &mut self.cb.core.list,
                &record.texture,
                record.subresource,
                record.used,
            );
        }
        self.cb.core.graphics_pipeline = None;
        self.cb.core.vertex.clear();
        self.cb.core.fragment.clear();
        self.cb.core.list.push(RawCommand::SetRenderTargets { colors: Vec::new(), depth: None });
    }

    /// Transitions every attachment back to its default state and unbinds
    /// the graphics state.
    pub fn end(mut self) {
        self.end_impl();
    }
}

impl Drop for RenderPass<'_> {
    fn drop(&mut self) {
        self.end_impl();
    }
}

/// A compute pass: read-write resources fixed at begin, read-only resources
/// bound during the pass, dispatches in between.
pub struct ComputePass<'a> {
    cb: &'a mut CommandBuffer,
    /// Read-only resources transitioned at bind, reverted at end.
    read_reverts: Vec<ReadRevert>,
    ended: bool,
}

enum ReadRevert {
    Texture(Arc<ConcreteTexture>),
    Buffer(Arc<ConcreteBuffer>, crate::BufferUsage),
}

impl<'a> ComputePass<'a> {
    pub fn bind_compute_pipeline(&mut self, pipeline: &ComputePipeline) {
        let inner = &pipeline.inner;
        self.cb.core.list.push(RawCommand::SetComputeRootSignature(Arc::clone(&inner.root.signature)));
        self.cb.core.list.push(RawCommand::SetComputePipeline(Arc::clone(&inner.raw)));
        self.cb.core.compute.read_textures_dirty = true;
        self.cb.core.compute.read_buffers_dirty = true;
        self.cb.core.compute.write_dirty = true;
        self.cb.core.compute_pipeline = Some(pipeline.clone());
        self.cb.core.tracked.track_compute_pipeline(pipeline);
        self.cb.ensure_uniform_wrappers(UniformStage::Compute, inner.num_uniform_buffers);
    }

    /// Binds read-only storage textures. Each is transitioned to the
    /// non-pixel shader-resource state here and back to its default at end
    /// of pass.
    pub fn bind_compute_storage_textures(&mut self, first_slot: u32, textures: &[&Texture]) {
        for (offset, texture) in textures.iter().enumerate() {
            let slot = first_slot as usize + offset;
            if slot >= MAX_STORAGE_TEXTURES_PER_STAGE {
                error!("compute storage texture slot {slot} out of range");
                break;
            }
            let concrete = texture.container.active();
            let seen = self
                .read_reverts
                .iter()
                .any(|revert| matches!(revert, ReadRevert::Texture(t) if Arc::ptr_eq(t, &concrete)));
            if !seen {
                for sub in 0..concrete.subresources.len() as u32 {
                    state::transition_texture_from_default(
                        &mut self.cb.core.list,
                        &concrete,
                        sub,
                        ResourceState::NonPixelShaderResource,
                    );
                }
                self.read_reverts.push(ReadRevert::Texture(Arc::clone(&concrete)));
            }
            self.cb.core.tracked.track_whole_texture(&concrete);
            self.cb.core.compute.read_storage_textures[slot] = Some(concrete);
        }
        self.cb.core.compute.read_textures_dirty = true;
    }

    /// Read-only storage buffer analog of
    /// [`bind_compute_storage_textures`](Self::bind_compute_storage_textures).
    pub fn bind_compute_storage_buffers(&mut self, first_slot: u32, buffers: &[&Buffer]) {
        for (offset, buffer) in buffers.iter().enumerate() {
            let slot = first_slot as usize + offset;
            if slot >= MAX_STORAGE_BUFFERS_PER_STAGE {
                error!("compute storage buffer slot {slot} out of range");
                break;
            }
            let concrete = buffer.container.active();
            let seen = self
                .read_reverts
                .iter()
                .any(|revert| matches!(revert, ReadRevert::Buffer(b, _) if Arc::ptr_eq(b, &concrete)));
            if !seen {
                state::transition_buffer_from_default(
                    &mut self.cb.core.list,
                    buffer.container.usage,
                    &concrete,
                    ResourceState::NonPixelShaderResource,
                );
                self.read_reverts
                    .push(ReadRevert::Buffer(Arc::clone(&concrete), buffer.container.usage));
            }
            self.cb.core.tracked.track_buffer(&concrete);
            self.cb.core.compute.read_storage_buffers[slot] = Some(concrete);
        }
        self.cb.core.compute.read_buffers_dirty = true;
    }

    pub fn push_compute_uniform_data(&mut self, slot: u32, data: &[u8]) {
        self.cb.push_uniform_data(UniformStage::Compute, slot, data);
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.cb.flush_compute_bindings();
        self.cb.core.list.push(RawCommand::Dispatch {
            x: group_count_x,
            y: group_count_y,
            z: group_count_z,
        });
    }

    pub fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) {
        let stride = self.cb.device.indirect_signatures.dispatch;
        if offset + stride > buffer.size() {
            error!("indirect dispatch arguments exceed the argument buffer");
            return;
        }
        let concrete = buffer.container.active();
        self.cb.core.tracked.track_buffer(&concrete);
        self.cb.flush_compute_bindings();
        self.cb.core.list.push(RawCommand::DispatchIndirect {
            buffer: Arc::clone(&concrete.raw),
            offset,
        });
    }

    pub fn insert_debug_label(&mut self, text: &str) {
        self.cb.insert_debug_label(text);
    }

    fn end_impl(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let write_textures = std::mem::take(&mut self.cb.core.compute.write_storage_textures);
        for (texture, sub) in write_textures {
            state::transition_texture_to_default(
                &mut self.cb.core.list,
                &texture,
                sub,
                ResourceState::UnorderedAccess,
            );
        }
        let write_buffers = std::mem::take(&mut self.cb.core.compute.write_storage_buffers);
        for (buffer, usage) in write_buffers {
            state::transition_buffer_to_default(
                &mut self.cb.core.list,
                usage,
                &buffer,
                ResourceState::UnorderedAccess,
            );
        }
        for revert in self.read_reverts.drain(..) {
            match revert {
                ReadRevert::Texture(texture) => {
                    for sub in 0..texture.subresources.len() as u32 {
                        state::transition_texture_to_default(
                            &mut self.cb.core.list,
                            &texture,
                            sub,
                            ResourceState::NonPixelShaderResource,
                        );
                    }
                }
                ReadRevert::Buffer(buffer, usage) => {
                    state::transition_buffer_to_default(
                        &mut self.cb.core.list,
                        usage,
                        &buffer,
                        ResourceState::NonPixelShaderResource,
                    );
                }
            }
        }
        self.cb.core.compute_pipeline = None;
        self.cb.core.compute.clear();
    }

    /// Transitions every bound storage resource back to its default state
    /// and unbinds the compute state.
    pub fn end(mut self) {
        self.end_impl();
    }
}

impl Drop for ComputePass<'_> {
    fn drop(&mut self) {
        self.end_impl();
    }
}

/// A copy pass: uploads, downloads, and resource-to-resource copies. Each
/// operation transitions its participants in and back out around the copy.
pub struct CopyPass<'a> {
    cb: &'a mut CommandBuffer,
    ended: bool,
}

impl<'a> CopyPass<'a> {
    /// Uploads from a transfer buffer into a GPU buffer region.
    pub fn upload_to_buffer(
        &mut self,
        source: &TransferBufferLocation<'_>,
        destination: &BufferRegion<'_>,
        cycle: bool,
    ) -> Result<()> {
        let device = Arc::clone(&self.cb.device);
        let src = source.transfer_buffer.container.active();
        let dst = state::prepare_buffer_for_write(
            &device,
            &mut self.cb.core.list,
            &destination.buffer.container,
            cycle,
            ResourceState::CopyDest,
        )?;
        self.cb.core.tracked.track_buffer(&src);
        self.cb.core.tracked.track_buffer(&dst);
        self.cb.core.list.push(RawCommand::CopyBufferRegion {
            src: Arc::clone(&src.raw),
            src_offset: source.offset,
            dst: Arc::clone(&dst.raw),
            dst_offset: destination.offset,
            size: destination.size,
        });
        state::transition_buffer_to_default(
            &mut self.cb.core.list,
            destination.buffer.container.usage,
            &dst,
            ResourceState::CopyDest,
        );
        Ok(())
    }

    /// Downloads a GPU buffer region into a transfer buffer.
    pub fn download_from_buffer(
        &mut self,
        source: &BufferRegion<'_>,
        destination: &TransferBufferLocation<'_>,
    ) {
        let src = source.buffer.container.active();
        let dst = destination.transfer_buffer.container.active();
        self.cb.core.tracked.track_buffer(&src);
        self.cb.core.tracked.track_buffer(&dst);
        state::transition_buffer_from_default(
            &mut self.cb.core.list,
            source.buffer.container.usage,
            &src,
            ResourceState::CopySource,
        );
        self.cb.core.list.push(RawCommand::CopyBufferRegion {
            src: Arc::clone(&src.raw),
            src_offset: source.offset,
            dst: Arc::clone(&dst.raw),
            dst_offset: destination.offset,
            size: source.size,
        });
        state::transition_buffer_to_default(
            &mut self.cb.core.list,
            source.buffer.container.usage,
            &src,
            ResourceState::CopySource,
        );
    }

    /// GPU-to-GPU buffer copy.
    pub fn copy_buffer_to_buffer(
        &mut self,
        source: &Buffer,
        source_offset: u64,
        destination: &Buffer,
        destination_offset: u64,
        size: u64,
        cycle: bool,
    ) -> Result<()> {
        let device = Arc::clone(&self.cb.device);
        let dst = state::prepare_buffer_for_write(
            &device,
            &mut self.cb.core.list,
            &destination.container,
            cycle,
            ResourceState::CopyDest,
        )?;
        let src = source.container.active();
        self.cb.core.tracked.track_buffer(&src);
        self.cb.core.tracked.track_buffer(&dst);
        state::transition_buffer_from_default(
            &mut self.cb.core.list,
            source.container.usage,
            &src,
            ResourceState::CopySource,
        );
        self.cb.core.list.push(RawCommand::CopyBufferRegion {
            src: Arc::clone(&src.raw),
            src_offset: source_offset,
            dst: Arc::clone(&dst.raw),
            dst_offset: destination_offset,
            size,
        });
        state::transition_buffer_to_default(
            &mut self.cb.core.list,
            source.container.usage,
            &src,
            ResourceState::CopySource,
        );
        state::transition_buffer_to_default(
            &mut self.cb.core.list,
            destination.container.usage,
            &dst,
            ResourceState::CopyDest,
        );
        Ok(())
    }

    /// Uploads texture data from a transfer buffer. When the caller's layout
    /// violates the backend's 256-byte row-pitch or 512-byte offset
    /// alignment, the data is repacked into a temporary buffer first.
    pub fn upload_to_texture(
        &mut self,
        source: &TextureTransferInfo<'_>,
        destination: &TextureRegion<'_>,
        cycle: bool,
    ) -> Result<()> {
        let device = Arc::clone(&self.cb.device);
        let container = &destination.texture.container;
        let (texture, sub) = state::prepare_texture_subresource_for_write(
            &device,
            &mut self.cb.core.list,
            container,
            destination.layer,
            destination.mip_level,
            cycle,
            ResourceState::CopyDest,
        )?;
        self.cb.core.tracked.track_texture_subresource(&texture, sub);
        let src = source.transfer_buffer.container.active();
        self.cb.core.tracked.track_buffer(&src);

        let layout = TransferLayout::of(source, destination);
        if layout.aligned(source.offset) {
            self.cb.core.list.push(RawCommand::CopyBufferToTexture {
                buffer: Arc::clone(&src.raw),
                buffer_offset: source.offset,
                row_pitch: layout.pitch,
                texture: Arc::clone(&texture.raw),
                subresource: sub,
                x: destination.x,
                y: destination.y,
                z: destination.z,
                w: destination.w,
                h: destination.h,
                d: destination.d,
            });
        } else {
            warn!(
                "texture upload repacked: align the transfer row pitch to {TEXTURE_ROW_PITCH_ALIGNMENT} \
                 and the offset to {TEXTURE_OFFSET_ALIGNMENT} to avoid an extra copy"
            );
            let aligned_pitch = layout.aligned_pitch();
            let temporary = RawBuffer::new(
                &device.raw,
                aligned_pitch as u64 * layout.rows as u64 * layout.slices as u64,
                HeapKind::Upload,
            );
            {
                let source_storage = src.raw.storage();
                let mut staged = temporary.storage();
                for slice in 0..layout.slices as usize {
                    for row in 0..layout.rows as usize {
                        let from = source.offset as usize
                            + slice * layout.pitch as usize * layout.rows_per_slice as usize
                            + row * layout.pitch as usize;
                        let to = (slice * layout.rows as usize + row) * aligned_pitch as usize;
                        staged[to..to + layout.row_bytes as usize]
                            .copy_from_slice(&source_storage[from..from + layout.row_bytes as usize]);
                    }
                }
            }
            self.cb.core.list.push(RawCommand::CopyBufferToTexture {
                buffer: Arc::clone(&temporary),
                buffer_offset: 0,
                row_pitch: aligned_pitch,
                texture: Arc::clone(&texture.raw),
                subresource: sub,
                x: destination.x,
                y: destination.y,
                z: destination.z,
                w: destination.w,
                h: destination.h,
                d: destination.d,
            });
            self.cb.core.temporaries.push(temporary);
        }
        state::transition_texture_to_default(
            &mut self.cb.core.list,
            &texture,
            sub,
            ResourceState::CopyDest,
        );
        Ok(())
    }

    /// Downloads a texture region into a transfer buffer. Misaligned layouts
    /// copy into an aligned temporary now and repack at retirement.
    pub fn download_from_texture(
        &mut self,
        source: &TextureRegion<'_>,
        destination: &TextureTransferInfo<'_>,
    ) {
        let texture = source.texture.container.active();
        let sub = texture.subresource_index(source.layer, source.mip_level);
        self.cb.core.tracked.track_texture_subresource(&texture, sub);
        let dst = destination.transfer_buffer.container.active();
        self.cb.core.tracked.track_buffer(&dst);

        state::transition_texture_from_default(
            &mut self.cb.core.list,
            &texture,
            sub,
            ResourceState::CopySource,
        );
        let layout = TransferLayout::of(destination, source);
        if layout.aligned(destination.offset) {
            self.cb.core.list.push(RawCommand::CopyTextureToBuffer {
                texture: Arc::clone(&texture.raw),
                subresource: sub,
                x: source.x,
                y: source.y,
                z: source.z,
                w: source.w,
                h: source.h,
                d: source.d,
                buffer: Arc::clone(&dst.raw),
                buffer_offset: destination.offset,
                row_pitch: layout.pitch,
            });
        } else {
            warn!(
                "texture download repacked: align the transfer row pitch to {TEXTURE_ROW_PITCH_ALIGNMENT} \
                 and the offset to {TEXTURE_OFFSET_ALIGNMENT} to avoid an extra copy"
            );
            let aligned_pitch = layout.aligned_pitch();
            let temporary = RawBuffer::new(
                &self.cb.device.raw,
                aligned_pitch as u64 * layout.rows as u64 * layout.slices as u64,
                HeapKind::Readback,
            );
            self.cb.core.list.push(RawCommand::CopyTextureToBuffer {
                texture: Arc::clone(&texture.raw),
                subresource: sub,
                x: source.x,
                y: source.y,
                z: source.z,
                w: source.w,
                h: source.h,
                d: source.d,
                buffer: Arc::clone(&temporary),
                buffer_offset: 0,
                row_pitch: aligned_pitch,
            });
            self.cb.core.texture_downloads.push(TextureDownload {
                temporary: Arc::clone(&temporary),
                destination: Arc::clone(&dst),
                destination_offset: destination.offset,
                temporary_pitch: aligned_pitch,
                destination_pitch: layout.pitch,
                destination_rows_per_slice: layout.rows_per_slice,
                row_bytes: layout.row_bytes,
                rows: layout.rows,
                slices: layout.slices,
            });
            self.cb.core.temporaries.push(temporary);
        }
        state::transition_texture_to_default(
            &mut self.cb.core.list,
            &texture,
            sub,
            ResourceState::CopySource,
        );
    }

    /// GPU-to-GPU texture region copy.
    pub fn copy_texture_to_texture(
        &mut self,
        source: &TextureLocation<'_>,
        destination: &TextureLocation<'_>,
        w: u32,
        h: u32,
        d: u32,
        cycle: bool,
    ) -> Result<()> {
        let device = Arc::clone(&self.cb.device);
        let (dst, dst_sub) = state::prepare_texture_subresource_for_write(
            &device,
            &mut self.cb.core.list,
            &destination.texture.container,
            destination.layer,
            destination.mip_level,
            cycle,
            ResourceState::CopyDest,
        )?;
        let src = source.texture.container.active();
        let src_sub = src.subresource_index(source.layer, source.mip_level);
        self.cb.core.tracked.track_texture_subresource(&src, src_sub);
        self.cb.core.tracked.track_texture_subresource(&dst, dst_sub);
        state::transition_texture_from_default(
            &mut self.cb.core.list,
            &src,
            src_sub,
            ResourceState::CopySource,
        );
        self.cb.core.list.push(RawCommand::CopyTextureToTexture {
            src: Arc::clone(&src.raw),
            src_subresource: src_sub,
            src_origin: (source.x, source.y, source.z),
            dst: Arc::clone(&dst.raw),
            dst_subresource: dst_sub,
            dst_origin: (destination.x, destination.y, destination.z),
            extent: (w, h, d),
        });
        state::transition_texture_to_default(
            &mut self.cb.core.list,
            &src,
            src_sub,
            ResourceState::CopySource,
        );
        state::transition_texture_to_default(
            &mut self.cb.core.list,
            &dst,
            dst_sub,
            ResourceState::CopyDest,
        );
        Ok(())
    }

    pub fn insert_debug_label(&mut self, text: &str) {
        self.cb.insert_debug_label(text);
    }

    fn end_impl(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
    }

    pub fn end(mut self) {
        self.end_impl();
    }
}

impl Drop for CopyPass<'_> {
    fn drop(&mut self) {
        self.end_impl();
    }
}

/// Row/slice layout of one texture transfer.
struct TransferLayout {
    /// Bytes of actual texel data per row.
    row_bytes: u32,
    /// Caller-declared bytes between row starts.
    pitch: u32,
    rows: u32,
    rows_per_slice: u32,
    slices: u32,
}

impl TransferLayout {
    fn of(transfer: &TextureTransferInfo<'_>, region: &TextureRegion<'_>) -> Self {
        let format = region.texture.container.info.format;
        let block = format.block_dimension();
        let row_bytes = region.w.div_ceil(block) * format.texel_block_size();
        let rows = region.h.div_ceil(block);
        let pitch = if transfer.pixels_per_row == 0 {
            row_bytes
        } else {
            transfer.pixels_per_row.div_ceil(block) * format.texel_block_size()
        };
        let rows_per_slice = if transfer.rows_per_layer == 0 {
            rows
        } else {
            transfer.rows_per_layer.div_ceil(block)
        };
        Self { row_bytes, pitch, rows, rows_per_slice, slices: region.d }
    }

    fn aligned(&self, offset: u64) -> bool {
        self.pitch % TEXTURE_ROW_PITCH_ALIGNMENT == 0
            && offset % TEXTURE_OFFSET_ALIGNMENT == 0
            && (self.slices <= 1 || self.rows_per_slice == self.rows)
    }

    fn aligned_pitch(&self) -> u32 {
        self.row_bytes.div_ceil(TEXTURE_ROW_PITCH_ALIGNMENT) * TEXTURE_ROW_PITCH_ALIGNMENT
    }
}
