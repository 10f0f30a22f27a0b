//! The reference tiled-resource backend: a frame-resource engine over the
//! native driver layer.
//!
//! The device owns the descriptor heaps, the pools (command buffers, fences,
//! uniform buffers, shader-visible heaps), the claimed windows, and the
//! deferred-destruction queues. Submission closes the recorded command list,
//! executes it, signals a pooled fence, presents, and then sweeps retired
//! command buffers and destroyable resources.

pub(crate) mod blit;
pub(crate) mod command;
pub(crate) mod descriptor;
pub(crate) mod fence;
pub(crate) mod native;
pub(crate) mod pipeline;
pub(crate) mod resource;
pub(crate) mod state;
pub(crate) mod swapchain;
pub(crate) mod uniform;

#[cfg(test)]
mod tests;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::{
    BufferUsage, ComputePipelineCreateInfo, DeviceCreateInfo, DeviceFeatures, DeviceProperties,
    Driver, GraphicsPipelineCreateInfo, PresentMode, SampleCount, SamplerCreateInfo,
    ShaderCreateInfo, SwapchainComposition, TextureCreateInfo, TextureFormat, TextureType,
    TextureUsage, TransferBufferUsage, MAX_FRAMES_IN_FLIGHT,
};

pub use command::{CommandBuffer, ComputePass, CopyPass, RenderPass};
pub use fence::Fence;
pub use pipeline::{ComputePipeline, GraphicsPipeline, Sampler, Shader};
pub use resource::{Buffer, Texture, TransferBuffer};
pub use swapchain::{SwapchainTexture, Window};

/// Authoring helpers for this backend's shader blobs.
pub mod bytecode {
    pub use super::native::shader::authoring::*;
    pub use super::native::shader::MAGIC;
}

use command::{CommandBufferCore, PresentEntry, TextureDownload};
use descriptor::{GpuHeapPool, StagingHeaps};
use fence::FenceInner;
use native::heap::DescriptorHeapKind;
use native::list::RawCommand;
use native::resource::ResourceState;
use native::RawDevice;
use resource::{BufferContainer, BufferKind, ConcreteBuffer, ConcreteTexture, TextureContainer};
use swapchain::{SwapchainState, WindowData};
use uniform::UniformBuffer;

/// Strides of the three indirect-command signatures the device creates at
/// initialization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndirectSignatures {
    pub(crate) draw: u64,
    pub(crate) draw_indexed: u64,
    pub(crate) dispatch: u64,
}

pub(crate) struct DeferredDestroy {
    pub(crate) buffers: Vec<Arc<ConcreteBuffer>>,
    pub(crate) textures: Vec<Arc<ConcreteTexture>>,
}

struct SubmittedCommandBuffer {
    core: CommandBufferCore,
    fence: Arc<FenceInner>,
}

pub(crate) struct DeviceShared {
    pub(crate) raw: Arc<RawDevice>,
    pub(crate) debug_mode: bool,
    features: DeviceFeatures,
    props: DeviceProperties,
    pub(crate) indirect_signatures: IndirectSignatures,
    /// Staging descriptor bookkeeping, one device-wide lock.
    pub(crate) staging: Mutex<StagingHeaps>,
    view_heap_pool: GpuHeapPool,
    sampler_heap_pool: GpuHeapPool,
    available_command_buffers: Mutex<Vec<CommandBufferCore>>,
    submitted_command_buffers: Mutex<Vec<SubmittedCommandBuffer>>,
    pub(crate) available_fences: Mutex<Vec<Arc<FenceInner>>>,
    pub(crate) available_uniform_buffers: Mutex<Vec<UniformBuffer>>,
    pub(crate) claimed_windows: Mutex<Vec<Arc<WindowData>>>,
    pub(crate) deferred: Mutex<DeferredDestroy>,
    /// Serializes submissions and the retirement sweep that follows them.
    submit_lock: Mutex<()>,
    blit: OnceLock<blit::BlitResources>,
}

impl DeviceShared {
    pub(crate) fn blit_resources(&self) -> &blit::BlitResources {
        self.blit.get().expect("blit resources initialized at device creation")
    }

    /// Moves deferred resources whose reference counts reached zero into
    /// final release.
    fn destruction_sweep(&self) {
        let mut deferred = self.deferred.lock().unwrap();
        deferred.buffers.retain(|buffer| buffer.in_flight());
        deferred.textures.retain(|texture| texture.total_refs() > 0);
    }
}

/// Retires every submitted command buffer whose fence has signalled.
fn sweep_submitted(device: &Arc<DeviceShared>) {
    let mut submitted = device.submitted_command_buffers.lock().unwrap();
    let mut index = 0;
    while index < submitted.len() {
        if submitted[index].fence.raw.completed() {
            let entry = submitted.remove(index);
            retire(device, entry);
        } else {
            index += 1;
        }
    }
}

fn retire(device: &Arc<DeviceShared>, entry: SubmittedCommandBuffer) {
    let SubmittedCommandBuffer { mut core, fence } = entry;
    for download in core.texture_downloads.drain(..) {
        apply_texture_download(&download);
    }
    if let Some(heap) = core.view_heap.take() {
        device.view_heap_pool.put_back(heap);
    }
    if let Some(heap) = core.sampler_heap.take() {
        device.sampler_heap_pool.put_back(heap);
    }
    uniform::return_uniform_buffers(device, core.uniforms.used.drain(..));
    core.tracked.release_all();
    if core.auto_release_fence {
        fence::release_fence(&fence);
    }
    core.reset_for_reuse();
    device.available_command_buffers.lock().unwrap().push(core);
}

pub(crate) fn wait_idle_internal(device: &Arc<DeviceShared>) {
    device.raw.wait_idle();
    sweep_submitted(device);
    device.destruction_sweep();
}

/// The submission pipeline. Holding the submit lock: transition the present
/// list, close and execute the list, signal a pooled fence, present each
/// window, then sweep retired work.
pub(crate) fn submit_command_buffer(
    device: &Arc<DeviceShared>,
    cb: CommandBuffer,
    want_fence: bool,
) -> Result<Option<Arc<FenceInner>>> {
    let CommandBuffer { device: _, mut core } = cb;
    let _guard = device.submit_lock.lock().unwrap();

    if let Some(reason) = device.raw.removed_reason() {
        // Fail noisily but keep accepting calls; the application is expected
        // to destroy the device.
        return Err(Error::DeviceRemoved(reason));
    }

    // Uniform buffers stay persistently mapped on this driver; there is
    // nothing to unmap before execution.
    for entry in &core.present_entries {
        core.list.push(RawCommand::Transition {
            target: native::list::BarrierTarget::TextureSubresource(
                Arc::clone(&entry.texture.raw),
                0,
            ),
            before: ResourceState::RenderTarget,
            after: ResourceState::Present,
        });
    }

    core.list.close();
    device.raw.execute_command_list(&mut core.list);

    let fence = fence::acquire_fence(device);
    device.raw.signal(Arc::clone(&fence.raw));
    core.auto_release_fence = !want_fence;

    let present_entries = std::mem::take(&mut core.present_entries);
    for entry in &present_entries {
        let mut state = entry.window.state.lock().unwrap();
        let sync_interval = u32::from(state.present_mode == PresentMode::Vsync);
        let allow_tearing =
            state.present_mode == PresentMode::Immediate && device.features.tearing;
        debug!(
            "present window {} back buffer {} (sync {sync_interval}, tearing {allow_tearing})",
            entry.window.window.inner.id, entry.back_buffer_index
        );
        state.raw.present();
        state.acquired[entry.back_buffer_index as usize] = false;
        let slot = state.frame_counter;
        if let Some(previous) = state.in_flight_fences[slot].take() {
            fence::release_fence(&previous);
        }
        fence.add_ref();
        state.in_flight_fences[slot] = Some(Arc::clone(&fence));
        state.frame_counter = (state.frame_counter + 1) % MAX_FRAMES_IN_FLIGHT;
    }

    device
        .submitted_command_buffers
        .lock()
        .unwrap()
        .push(SubmittedCommandBuffer { core, fence: Arc::clone(&fence) });

    sweep_submitted(device);
    device.destruction_sweep();
    Ok(want_fence.then_some(fence))
}

fn apply_texture_download(download: &TextureDownload) {
    let staged = download.temporary.storage();
    let mut destination = download.destination.raw.storage();
    for slice in 0..download.slices as usize {
        for row in 0..download.rows as usize {
            let from = (slice * download.rows as usize + row) * download.temporary_pitch as usize;
            let to = download.destination_offset as usize
                + slice
                    * download.destination_pitch as usize
                    * download.destination_rows_per_slice as usize
                + row * download.destination_pitch as usize;
            destination[to..to + download.row_bytes as usize]
                .copy_from_slice(&staged[from..from + download.row_bytes as usize]);
        }
    }
}

/// A mapped transfer-buffer range. Upload maps write back to the buffer when
/// the map is dropped (or `unmap` is called); download maps are snapshots of
/// the downloaded contents.
pub struct TransferMap<'a> {
    _buffer: &'a TransferBuffer,
    concrete: Arc<ConcreteBuffer>,
    data: Vec<u8>,
    write_back: bool,
}

impl Deref for TransferMap<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for TransferMap<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl TransferMap<'_> {
    pub fn unmap(self) {}
}

impl Drop for TransferMap<'_> {
    fn drop(&mut self) {
        if self.write_back {
            self.concrete.raw.storage().copy_from_slice(&self.data);
        }
    }
}

/// The GPU device: owns the queue, the pools, and every claimed window.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.driver())
            .field("debug_mode", &self.shared.debug_mode)
            .finish()
    }
}

impl Device {
    pub fn new(info: &DeviceCreateInfo) -> Result<Device> {
        let mut debug_mode = info.debug_mode;
        match std::env::var("EMBER_DEBUG") {
            Ok(value) if value == "1" || value.eq_ignore_ascii_case("true") => debug_mode = true,
            Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => debug_mode = false,
            _ => {}
        }
        if info.prefer_low_power {
            debug!("low-power adapter preference noted; single-adapter runtime");
        }
        let raw = RawDevice::new(debug_mode, info.props.completion_latency);
        let shared = Arc::new(DeviceShared {
            staging: Mutex::new(StagingHeaps::new(&raw)),
            view_heap_pool: GpuHeapPool::new(
                DescriptorHeapKind::View,
                descriptor::GPU_VIEW_HEAP_CAPACITY,
            ),
            sampler_heap_pool: GpuHeapPool::new(
                DescriptorHeapKind::Sampler,
                descriptor::GPU_SAMPLER_HEAP_CAPACITY,
            ),
            raw,
            debug_mode,
            features: DeviceFeatures {
                uma: false,
                cache_coherent_uma: false,
                fast_uniform_upload_heap: true,
                tearing: true,
            },
            props: info.props.clone(),
            indirect_signatures: IndirectSignatures {
                draw: std::mem::size_of::<crate::IndirectDrawArguments>() as u64,
                draw_indexed: std::mem::size_of::<crate::IndirectDrawIndexedArguments>() as u64,
                dispatch: std::mem::size_of::<crate::IndirectDispatchArguments>() as u64,
            },
            available_command_buffers: Mutex::new(Vec::new()),
            submitted_command_buffers: Mutex::new(Vec::new()),
            available_fences: Mutex::new(Vec::new()),
            available_uniform_buffers: Mutex::new(Vec::new()),
            claimed_windows: Mutex::new(Vec::new()),
            deferred: Mutex::new(DeferredDestroy { buffers: Vec::new(), textures: Vec::new() }),
            submit_lock: Mutex::new(()),
            blit: OnceLock::new(),
        });
        let blit_resources = blit::BlitResources::create(&shared)?;
        let _ = shared.blit.set(blit_resources);
        debug!("tiled device created (debug {debug_mode})");
        Ok(Device { shared })
    }

    pub fn driver(&self) -> Driver {
        Driver::Tiled
    }

    pub fn features(&self) -> DeviceFeatures {
        self.shared.features
    }

    pub fn vertex_semantic(&self) -> &str {
        &self.shared.props.vertex_semantic
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    // ------------------------------------------------------------------
    // Resources

    pub fn create_buffer(&self, usage: BufferUsage, size: u64) -> Result<Buffer> {
        if usage.is_empty() {
            return Err(Error::ResourceCreation("buffer with empty usage".into()));
        }
        let container = BufferContainer::create(&self.shared, usage, BufferKind::Gpu, size)?;
        Ok(Buffer { container })
    }

    pub fn create_transfer_buffer(
        &self,
        usage: TransferBufferUsage,
        size: u64,
    ) -> Result<TransferBuffer> {
        let kind = match usage {
            TransferBufferUsage::Upload => BufferKind::Upload,
            TransferBufferUsage::Download => BufferKind::Readback,
        };
        let container = BufferContainer::create(&self.shared, BufferUsage::empty(), kind, size)?;
        Ok(TransferBuffer { container, usage })
    }

    pub fn create_texture(&self, info: &TextureCreateInfo) -> Result<Texture> {
        let container = TextureContainer::create(&self.shared, info)?;
        Ok(Texture { container })
    }

    pub fn create_sampler(&self, info: &SamplerCreateInfo) -> Result<Sampler> {
        pipeline::create_sampler(&self.shared, info)
    }

    pub fn create_shader(&self, info: &ShaderCreateInfo<'_>) -> Result<Shader> {
        pipeline::create_shader(info)
    }

    pub fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<GraphicsPipeline> {
        pipeline::create_graphics_pipeline(&self.shared, info)
    }

    pub fn create_compute_pipeline(
        &self,
        info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<ComputePipeline> {
        pipeline::create_compute_pipeline(&self.shared, info)
    }

    /// Propagates the name to every concrete buffer in the container, now
    /// and for resources created by future cycles.
    pub fn set_buffer_name(&self, buffer: &Buffer, name: &str) {
        buffer.container.set_name(name);
    }

    pub fn set_texture_name(&self, texture: &Texture, name: &str) {
        texture.container.set_name(name);
    }

    /// Maps a transfer buffer. With `cycle`, an in-flight buffer is rotated
    /// out first, so the caller may overwrite freely.
    pub fn map_transfer_buffer<'a>(
        &self,
        buffer: &'a TransferBuffer,
        cycle: bool,
    ) -> Result<TransferMap<'a>> {
        if cycle && buffer.container.active().in_flight() {
            buffer.container.cycle_active(&self.shared)?;
        }
        let concrete = buffer.container.active();
        let data = concrete.raw.storage().clone();
        Ok(TransferMap {
            _buffer: buffer,
            write_back: buffer.usage == TransferBufferUsage::Upload,
            concrete,
            data,
        })
    }

    // ------------------------------------------------------------------
    // Recording and submission

    /// Draws a command buffer from the pool and stamps it with freshly
    /// acquired shader-visible heaps.
    pub fn acquire_command_buffer(&self) -> Result<CommandBuffer> {
        let mut core = self
            .shared
            .available_command_buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(CommandBufferCore::new);
        let view_heap = self.shared.view_heap_pool.acquire(&self.shared.raw);
        let sampler_heap = self.shared.sampler_heap_pool.acquire(&self.shared.raw);
        core.list.push(RawCommand::SetDescriptorHeaps {
            view: Arc::clone(view_heap.raw()),
            sampler: Arc::clone(sampler_heap.raw()),
        });
        core.view_heap = Some(view_heap);
        core.sampler_heap = Some(sampler_heap);
        Ok(CommandBuffer { device: Arc::clone(&self.shared), core })
    }

    /// Blocks until the queue drains, retires every submitted command
    /// buffer, and runs the destruction sweep.
    pub fn wait_idle(&self) {
        wait_idle_internal(&self.shared);
    }

    /// Non-blocking completion check.
    pub fn query_fence(&self, fence: &Fence) -> bool {
        self.shared.raw.poll();
        let completed = fence.inner.raw.completed();
        if completed {
            sweep_submitted(&self.shared);
        }
        completed
    }

    /// Blocks on the given fences; all of them with `wait_all`, any one
    /// otherwise. Retires whatever completed before returning.
    pub fn wait_for_fences(&self, wait_all: bool, fences: &[&Fence]) {
        if fences.is_empty() {
            return;
        }
        if wait_all {
            for fence in fences {
                self.shared.raw.wait_fence(&fence.inner.raw);
            }
        } else {
            let raw_fences: Vec<&Arc<native::RawFence>> =
                fences.iter().map(|fence| &fence.inner.raw).collect();
            self.shared.raw.wait_any(&raw_fences);
        }
        sweep_submitted(&self.shared);
        self.shared.destruction_sweep();
    }

    // ------------------------------------------------------------------
    // Swapchain

    /// Claims a window: creates its swapchain with `MAX_FRAMES_IN_FLIGHT`
    /// back buffers in the requested composition and present mode.
    pub fn claim_window(
        &self,
        window: &Window,
        composition: SwapchainComposition,
        present_mode: PresentMode,
    ) -> Result<()> {
        if !swapchain::supports_composition(composition) {
            return Err(Error::UnsupportedComposition);
        }
        if !swapchain::supports_present_mode(present_mode) {
            return Err(Error::UnsupportedPresentMode);
        }
        let mut claimed = self.shared.claimed_windows.lock().unwrap();
        if claimed.iter().any(|data| data.window.is(window)) {
            return Err(Error::Initialization("window already claimed".into()));
        }
        let state = SwapchainState::create(&self.shared, window, composition, present_mode);
        claimed.push(Arc::new(WindowData { window: window.clone(), state: Mutex::new(state) }));
        Ok(())
    }

    pub fn unclaim_window(&self, window: &Window) {
        wait_idle_internal(&self.shared);
        let mut claimed = self.shared.claimed_windows.lock().unwrap();
        if let Some(position) = claimed.iter().position(|data| data.window.is(window)) {
            let data = claimed.remove(position);
            let mut state = data.state.lock().unwrap();
            for slot in &mut state.in_flight_fences {
                if let Some(fence) = slot.take() {
                    fence::release_fence(&fence);
                }
            }
        }
        drop(claimed);
        self.shared.destruction_sweep();
    }

    /// Recreates the swapchain with new parameters. Returns `false` without
    /// touching the existing swapchain when the combination is unsupported.
    pub fn set_swapchain_parameters(
        &self,
        window: &Window,
        composition: SwapchainComposition,
        present_mode: PresentMode,
    ) -> bool {
        if !swapchain::supports_composition(composition)
            || !swapchain::supports_present_mode(present_mode)
        {
            return false;
        }
        let Ok(data) = swapchain::find_window_data(&self.shared, window) else {
            return false;
        };
        wait_idle_internal(&self.shared);
        let mut state = data.state.lock().unwrap();
        for slot in &mut state.in_flight_fences {
            if let Some(fence) = slot.take() {
                fence::release_fence(&fence);
            }
        }
        *state = SwapchainState::create(&self.shared, window, composition, present_mode);
        true
    }

    pub fn swapchain_texture_format(&self, window: &Window) -> Result<TextureFormat> {
        let data = swapchain::find_window_data(&self.shared, window)?;
        let state = data.state.lock().unwrap();
        Ok(state.composition.texture_format())
    }

    /// Acquires the window's current back buffer into the command buffer.
    ///
    /// Returns `Ok(None)` when the frame should be skipped: in immediate and
    /// mailbox modes when the in-flight slot has not retired yet, or when
    /// the back buffer is still held by an unsubmitted command buffer. In
    /// vsync mode the call blocks on the in-flight fence instead.
    pub fn acquire_swapchain_texture(
        &self,
        cb: &mut CommandBuffer,
        window: &Window,
    ) -> Result<Option<SwapchainTexture>> {
        let data = swapchain::find_window_data(&self.shared, window)?;
        let mut state = data.state.lock().unwrap();

        let (width, height) = window.size();
        if (width, height) != state.raw.extent() {
            wait_idle_internal(&self.shared);
            state.resize(&self.shared, width, height);
        }

        let slot = state.frame_counter;
        if let Some(fence) = state.in_flight_fences[slot].take() {
            match state.present_mode {
                PresentMode::Vsync => {
                    self.shared.raw.wait_fence(&fence.raw);
                    fence::release_fence(&fence);
                    sweep_submitted(&self.shared);
                }
                PresentMode::Immediate | PresentMode::Mailbox => {
                    self.shared.raw.poll();
                    if !fence.raw.completed() {
                        state.in_flight_fences[slot] = Some(fence);
                        return Ok(None);
                    }
                    fence::release_fence(&fence);
                    sweep_submitted(&self.shared);
                }
            }
        }

        let index = state.raw.back_buffer_index();
        if state.acquired[index as usize] {
            // Still owned by a command buffer that has not presented.
            return Ok(None);
        }
        let container = Arc::clone(&state.containers[index as usize]);
        let texture = container.active();
        cb.core.list.push(RawCommand::Transition {
            target: native::list::BarrierTarget::TextureSubresource(Arc::clone(&texture.raw), 0),
            before: ResourceState::Present,
            after: ResourceState::RenderTarget,
        });
        cb.core.tracked.track_texture_subresource(&texture, 0);
        cb.core.present_entries.push(PresentEntry {
            window: Arc::clone(&data),
            back_buffer_index: index,
            texture,
        });
        state.acquired[index as usize] = true;
        Ok(Some(SwapchainTexture { texture: Texture { container }, width, height }))
    }

    // ------------------------------------------------------------------
    // Queries

    pub fn supports_texture_format(
        &self,
        format: TextureFormat,
        texture_type: TextureType,
        usage: TextureUsage,
    ) -> bool {
        let compressed = format.block_dimension() > 1;
        if compressed {
            let allowed = TextureUsage::SAMPLER | TextureUsage::GRAPHICS_STORAGE_READ;
            return texture_type != TextureType::D3 && allowed.contains(usage);
        }
        if format.is_depth() {
            let allowed = TextureUsage::DEPTH_STENCIL_TARGET | TextureUsage::SAMPLER;
            return matches!(texture_type, TextureType::D2 | TextureType::D2Array)
                && allowed.contains(usage);
        }
        if usage.contains(TextureUsage::DEPTH_STENCIL_TARGET) {
            return false;
        }
        true
    }

    pub fn supports_present_mode(&self, mode: PresentMode) -> bool {
        swapchain::supports_present_mode(mode)
    }

    pub fn supports_swapchain_composition(&self, composition: SwapchainComposition) -> bool {
        swapchain::supports_composition(composition)
    }

    /// Highest supported sample count not exceeding the desired one.
    pub fn best_sample_count(&self, format: TextureFormat, desired: SampleCount) -> SampleCount {
        if format.block_dimension() > 1 {
            return SampleCount::One;
        }
        desired.min(SampleCount::Eight)
    }

    // ------------------------------------------------------------------
    // Debug-layer access

    /// Drains the driver debug layer. Empty means every barrier and binding
    /// the engine emitted checked out.
    pub fn take_validation_messages(&self) -> Vec<String> {
        self.shared.raw.take_validation_messages()
    }

    #[cfg(test)]
    pub(crate) fn simulate_device_removed(&self, reason: &str) {
        self.shared.raw.mark_removed(reason.to_owned());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        wait_idle_internal(&self.shared);
        let windows = std::mem::take(&mut *self.shared.claimed_windows.lock().unwrap());
        for data in windows {
            let mut state = data.state.lock().unwrap();
            for slot in &mut state.in_flight_fences {
                if let Some(fence) = slot.take() {
                    fence::release_fence(&fence);
                }
            }
        }
        self.shared.destruction_sweep();
        if let Some(reason) = self.shared.raw.removed_reason() {
            error!("device destroyed after removal: {reason}");
        }
    }
}
