//! Buffer and texture containers.
//!
//! A container is the cheap client-side handle: it owns an ordered list of
//! concrete resources and an `active` index. Writes land in the active
//! resource; the cycling engine rotates the active index to an unreferenced
//! concrete resource (or creates one) so callers can overwrite freely without
//! waiting on the GPU. Dropping the last public handle pushes the concrete
//! resources onto the device's deferred-destruction queue.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::{BufferUsage, TextureCreateInfo, TextureType, TextureUsage, TransferBufferUsage};

use super::descriptor::CpuDescriptor;
use super::native::heap::RawDescriptor;
use super::native::resource::{HeapKind, RawBuffer, RawTexture, RawTextureDesc};
use super::DeviceShared;

/// What memory a concrete buffer is committed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    Gpu,
    UniformUpload,
    Upload,
    Readback,
}

impl BufferKind {
    pub(crate) fn heap(self) -> HeapKind {
        match self {
            BufferKind::Gpu => HeapKind::Default,
            BufferKind::UniformUpload | BufferKind::Upload => HeapKind::Upload,
            BufferKind::Readback => HeapKind::Readback,
        }
    }
}

pub(crate) struct ContainerEntries<T> {
    pub(crate) entries: Vec<Arc<T>>,
    pub(crate) active: usize,
}

impl<T> ContainerEntries<T> {
    fn new(first: Arc<T>) -> Self {
        Self { entries: vec![first], active: 0 }
    }

    pub(crate) fn active(&self) -> Arc<T> {
        Arc::clone(&self.entries[self.active])
    }
}

/// One committed buffer plus its views.
pub(crate) struct ConcreteBuffer {
    device: Weak<DeviceShared>,
    pub(crate) raw: Arc<RawBuffer>,
    pub(crate) srv: Option<CpuDescriptor>,
    pub(crate) uav: Option<CpuDescriptor>,
    pub(crate) cbv: Option<CpuDescriptor>,
    ref_count: AtomicU32,
    /// Whether this buffer has ever been transitioned away from the common
    /// state its heap committed it in.
    pub(crate) transitioned: AtomicBool,
    debug_name: Mutex<Option<String>>,
}

impl ConcreteBuffer {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        usage: BufferUsage,
        kind: BufferKind,
        size: u64,
        name: Option<&str>,
    ) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::ResourceCreation("zero-size buffer".into()));
        }
        let raw = RawBuffer::new(&device.raw, size, kind.heap());
        let mut srv = None;
        let mut uav = None;
        let mut cbv = None;
        {
            let mut staging = device.staging.lock().unwrap();
            if usage.intersects(BufferUsage::GRAPHICS_STORAGE_READ | BufferUsage::COMPUTE_STORAGE_READ) {
                let descriptor = staging.view.allocate();
                descriptor.write(RawDescriptor::BufferSrv { buffer: Arc::clone(&raw) });
                srv = Some(descriptor);
            }
            if usage.intersects(BufferUsage::GRAPHICS_STORAGE_WRITE | BufferUsage::COMPUTE_STORAGE_WRITE) {
                let descriptor = staging.view.allocate();
                descriptor.write(RawDescriptor::BufferUav { buffer: Arc::clone(&raw) });
                uav = Some(descriptor);
            }
            if kind == BufferKind::UniformUpload {
                let descriptor = staging.view.allocate();
                descriptor.write(RawDescriptor::BufferCbv { buffer: Arc::clone(&raw) });
                cbv = Some(descriptor);
            }
        }
        Ok(Arc::new(Self {
            device: Arc::downgrade(device),
            raw,
            srv,
            uav,
            cbv,
            ref_count: AtomicU32::new(0),
            transitioned: AtomicBool::new(false),
            debug_name: Mutex::new(name.map(str::to_owned)),
        }))
    }

    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn set_debug_name(&self, name: &str) {
        *self.debug_name.lock().unwrap() = Some(name.to_owned());
    }
}

impl Drop for ConcreteBuffer {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let mut staging = device.staging.lock().unwrap();
            for descriptor in [self.srv.as_mut(), self.uav.as_mut(), self.cbv.as_mut()]
                .into_iter()
                .flatten()
            {
                staging.view.release(descriptor);
            }
        }
    }
}

impl std::fmt::Debug for ConcreteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcreteBuffer")
            .field("id", &self.raw.id)
            .field("size", &self.raw.size)
            .field("refs", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct BufferContainer {
    pub(crate) device: Weak<DeviceShared>,
    pub(crate) usage: BufferUsage,
    pub(crate) size: u64,
    pub(crate) kind: BufferKind,
    pub(crate) state: Mutex<ContainerEntries<ConcreteBuffer>>,
    name: Mutex<Option<String>>,
}

impl BufferContainer {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        usage: BufferUsage,
        kind: BufferKind,
        size: u64,
    ) -> Result<Arc<Self>> {
        let first = ConcreteBuffer::create(device, usage, kind, size, None)?;
        Ok(Arc::new(Self {
            device: Arc::downgrade(device),
            usage,
            size,
            kind,
            state: Mutex::new(ContainerEntries::new(first)),
            name: Mutex::new(None),
        }))
    }

    pub(crate) fn active(&self) -> Arc<ConcreteBuffer> {
        self.state.lock().unwrap().active()
    }

    /// Makes some unreferenced concrete buffer active, creating a fresh one
    /// when every existing entry is in flight. Contents of the new active
    /// buffer are undefined.
    pub(crate) fn cycle_active(&self, device: &Arc<DeviceShared>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(free) = state.entries.iter().position(|entry| !entry.in_flight()) {
            state.active = free;
            return Ok(());
        }
        let name = self.name.lock().unwrap().clone();
        let fresh = ConcreteBuffer::create(device, self.usage, self.kind, self.size, name.as_deref())?;
        state.entries.push(fresh);
        state.active = state.entries.len() - 1;
        Ok(())
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = Some(name.to_owned());
        for entry in &self.state.lock().unwrap().entries {
            entry.set_debug_name(name);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

impl Drop for BufferContainer {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let entries = std::mem::take(&mut self.state.lock().unwrap().entries);
            device.deferred.lock().unwrap().buffers.extend(entries);
        }
    }
}

impl std::fmt::Debug for BufferContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferContainer")
            .field("usage", &self.usage)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A logical GPU buffer.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) container: Arc<BufferContainer>,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.container.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.container.usage
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.container.fmt(f)
    }
}

/// Host-visible staging memory for uploads or downloads.
#[derive(Clone)]
pub struct TransferBuffer {
    pub(crate) container: Arc<BufferContainer>,
    pub(crate) usage: TransferBufferUsage,
}

impl TransferBuffer {
    pub fn size(&self) -> u64 {
        self.container.size
    }

    pub fn usage(&self) -> TransferBufferUsage {
        self.usage
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.container.fmt(f)
    }
}

/// Per sub-resource views and in-flight bookkeeping. Sub-resource `i` of a
/// texture is (layer `i / levels`, level `i % levels`).
pub(crate) struct TextureSubresource {
    pub(crate) rtv: Option<CpuDescriptor>,
    pub(crate) dsv: Option<CpuDescriptor>,
    pub(crate) srv: Option<CpuDescriptor>,
    pub(crate) uav: Option<CpuDescriptor>,
    ref_count: AtomicU32,
}

impl TextureSubresource {
    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) > 0
    }
}

pub(crate) struct ConcreteTexture {
    device: Weak<DeviceShared>,
    pub(crate) raw: Arc<RawTexture>,
    /// Whole-resource SRV; present for sampled and storage-read usage and on
    /// swapchain textures.
    pub(crate) srv: Option<CpuDescriptor>,
    pub(crate) subresources: Vec<TextureSubresource>,
    pub(crate) is_swapchain: bool,
    debug_name: Mutex<Option<String>>,
}

impl ConcreteTexture {
    fn build_views(
        device: &Arc<DeviceShared>,
        raw: &Arc<RawTexture>,
        info: &TextureCreateInfo,
        is_swapchain: bool,
    ) -> (Option<CpuDescriptor>, Vec<TextureSubresource>) {
        let usage = info.usage;
        let mut staging = device.staging.lock().unwrap();
        let whole_srv = if is_swapchain
            || usage.intersects(
                TextureUsage::SAMPLER
                    | TextureUsage::GRAPHICS_STORAGE_READ
                    | TextureUsage::COMPUTE_STORAGE_READ,
            ) {
            let descriptor = staging.view.allocate();
            descriptor.write(RawDescriptor::TextureSrv {
                texture: Arc::clone(raw),
                subresource: None,
            });
            Some(descriptor)
        } else {
            None
        };

        let subresource_count = info.layer_count() * info.level_count;
        let mut subresources = Vec::with_capacity(subresource_count as usize);
        for sub in 0..subresource_count {
            let mut rtv = None;
            let mut dsv = None;
            let mut srv = None;
            let mut uav = None;
            if usage.contains(TextureUsage::COLOR_TARGET) {
                let descriptor = staging.render_target.allocate();
                descriptor.write(RawDescriptor::TextureRtv {
                    texture: Arc::clone(raw),
                    subresource: sub,
                    format: info.format,
                });
                rtv = Some(descriptor);
            }
            if usage.contains(TextureUsage::DEPTH_STENCIL_TARGET) {
                let descriptor = staging.depth_stencil.allocate();
                descriptor.write(RawDescriptor::TextureDsv {
                    texture: Arc::clone(raw),
                    subresource: sub,
                });
                dsv = Some(descriptor);
            }
            if !is_swapchain
                && usage.intersects(
                    TextureUsage::GRAPHICS_STORAGE_READ | TextureUsage::COMPUTE_STORAGE_READ,
                )
            {
                let descriptor = staging.view.allocate();
                descriptor.write(RawDescriptor::TextureSrv {
                    texture: Arc::clone(raw),
                    subresource: Some(sub),
                });
                srv = Some(descriptor);
            }
            if !is_swapchain && usage.contains(TextureUsage::COMPUTE_STORAGE_WRITE) {
                let descriptor = staging.view.allocate();
                descriptor.write(RawDescriptor::TextureUav {
                    texture: Arc::clone(raw),
                    subresource: sub,
                });
                uav = Some(descriptor);
            }
            subresources.push(TextureSubresource {
                rtv,
                dsv,
                srv,
                uav,
                ref_count: AtomicU32::new(0),
            });
        }
        (whole_srv, subresources)
    }

    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        info: &TextureCreateInfo,
        name: Option<&str>,
    ) -> Result<Arc<Self>> {
        let desc = RawTextureDesc {
            texture_type: info.texture_type,
            format: info.format,
            usage: info.usage,
            width: info.width,
            height: info.height,
            depth: info.depth(),
            layer_count: info.layer_count(),
            level_count: info.level_count,
            sample_count: info.sample_count,
        };
        let initial = super::state::texture_default_state(info.usage);
        let raw = RawTexture::new(&device.raw, desc, initial);
        let (srv, subresources) = Self::build_views(device, &raw, info, false);
        Ok(Arc::new(Self {
            device: Arc::downgrade(device),
            raw,
            srv,
            subresources,
            is_swapchain: false,
            debug_name: Mutex::new(name.map(str::to_owned)),
        }))
    }

    /// Wraps a swapchain back buffer: whole SRV plus one RTV, never cycled.
    pub(crate) fn wrap_swapchain(
        device: &Arc<DeviceShared>,
        raw: Arc<RawTexture>,
        info: &TextureCreateInfo,
    ) -> Arc<Self> {
        let (srv, subresources) = Self::build_views(device, &raw, info, true);
        Arc::new(Self {
            device: Arc::downgrade(device),
            raw,
            srv,
            subresources,
            is_swapchain: true,
            debug_name: Mutex::new(None),
        })
    }

    pub(crate) fn subresource_index(&self, layer: u32, level: u32) -> u32 {
        layer * self.raw.desc.level_count + level
    }

    pub(crate) fn total_refs(&self) -> u32 {
        self.subresources
            .iter()
            .map(|sub| sub.ref_count.load(Ordering::Acquire))
            .sum()
    }

    pub(crate) fn default_state(&self) -> super::native::resource::ResourceState {
        if self.is_swapchain {
            super::native::resource::ResourceState::RenderTarget
        } else {
            super::state::texture_default_state(self.raw.desc.usage)
        }
    }

    pub(crate) fn set_debug_name(&self, name: &str) {
        *self.debug_name.lock().unwrap() = Some(name.to_owned());
    }
}

impl Drop for ConcreteTexture {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let mut staging = device.staging.lock().unwrap();
            if let Some(srv) = self.srv.as_mut() {
                staging.view.release(srv);
            }
            for sub in &mut self.subresources {
                if let Some(rtv) = sub.rtv.as_mut() {
                    staging.render_target.release(rtv);
                }
                if let Some(dsv) = sub.dsv.as_mut() {
                    staging.depth_stencil.release(dsv);
                }
                if let Some(srv) = sub.srv.as_mut() {
                    staging.view.release(srv);
                }
                if let Some(uav) = sub.uav.as_mut() {
                    staging.view.release(uav);
                }
            }
        }
    }
}

impl std::fmt::Debug for ConcreteTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcreteTexture")
            .field("id", &self.raw.id)
            .field("subresources", &self.subresources.len())
            .finish()
    }
}

pub(crate) struct TextureContainer {
    pub(crate) device: Weak<DeviceShared>,
    pub(crate) info: TextureCreateInfo,
    pub(crate) can_be_cycled: bool,
    pub(crate) state: Mutex<ContainerEntries<ConcreteTexture>>,
    name: Mutex<Option<String>>,
}

impl TextureContainer {
    pub(crate) fn create(device: &Arc<DeviceShared>, info: &TextureCreateInfo) -> Result<Arc<Self>> {
        validate_texture_info(info)?;
        let first = ConcreteTexture::create(device, info, None)?;
        Ok(Arc::new(Self {
            device: Arc::downgrade(device),
            info: info.clone(),
            can_be_cycled: true,
            state: Mutex::new(ContainerEntries::new(first)),
            name: Mutex::new(None),
        }))
    }

    pub(crate) fn wrap_swapchain(
        device: &Arc<DeviceShared>,
        raw: Arc<RawTexture>,
        info: TextureCreateInfo,
    ) -> Arc<Self> {
        let first = ConcreteTexture::wrap_swapchain(device, raw, &info);
        Arc::new(Self {
            device: Arc::downgrade(device),
            info,
            can_be_cycled: false,
            state: Mutex::new(ContainerEntries::new(first)),
            name: Mutex::new(None),
        })
    }

    pub(crate) fn active(&self) -> Arc<ConcreteTexture> {
        self.state.lock().unwrap().active()
    }

    /// Texture analog of buffer cycling: an entry is free when the sum of
    /// its sub-resource reference counts is zero.
    pub(crate) fn cycle_active(&self, device: &Arc<DeviceShared>) -> Result<()> {
        debug_assert!(self.can_be_cycled, "cycling a swapchain texture container");
        let mut state = self.state.lock().unwrap();
        if let Some(free) = state.entries.iter().position(|entry| entry.total_refs() == 0) {
            state.active = free;
            return Ok(());
        }
        let name = self.name.lock().unwrap().clone();
        let fresh = ConcreteTexture::create(device, &self.info, name.as_deref())?;
        state.entries.push(fresh);
        state.active = state.entries.len() - 1;
        Ok(())
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = Some(name.to_owned());
        for entry in &self.state.lock().unwrap().entries {
            entry.set_debug_name(name);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

impl Drop for TextureContainer {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            let entries = std::mem::take(&mut self.state.lock().unwrap().entries);
            device.deferred.lock().unwrap().textures.extend(entries);
        }
    }
}

impl std::fmt::Debug for TextureContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureContainer")
            .field("info", &self.info)
            .field("can_be_cycled", &self.can_be_cycled)
            .finish()
    }
}

/// A logical GPU texture.
#[derive(Clone)]
pub struct Texture {
    pub(crate) container: Arc<TextureContainer>,
}

impl Texture {
    pub fn format(&self) -> crate::TextureFormat {
        self.container.info.format
    }

    pub fn texture_type(&self) -> TextureType {
        self.container.info.texture_type
    }

    pub fn usage(&self) -> TextureUsage {
        self.container.info.usage
    }

    pub fn width(&self) -> u32 {
        self.container.info.width
    }

    pub fn height(&self) -> u32 {
        self.container.info.height
    }

    pub fn level_count(&self) -> u32 {
        self.container.info.level_count
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.container.fmt(f)
    }
}

fn validate_texture_info(info: &TextureCreateInfo) -> Result<()> {
    if info.width == 0 || info.height == 0 || info.layer_count_or_depth == 0 {
        return Err(Error::ResourceCreation("zero-extent texture".into()));
    }
    if info.level_count == 0 {
        return Err(Error::ResourceCreation("texture with zero mip levels".into()));
    }
    if info.texture_type == TextureType::Cube && info.layer_count_or_depth % 6 != 0 {
        return Err(Error::ResourceCreation(
            "cube texture layer count must be a multiple of 6".into(),
        ));
    }
    if info.format.is_depth() && !info.usage.contains(TextureUsage::DEPTH_STENCIL_TARGET) {
        return Err(Error::ResourceCreation(
            "depth format without depth-stencil-target usage".into(),
        ));
    }
    if !info.format.is_depth() && info.usage.contains(TextureUsage::DEPTH_STENCIL_TARGET) {
        return Err(Error::ResourceCreation(
            "depth-stencil-target usage requires a depth format".into(),
        ));
    }
    Ok(())
}
