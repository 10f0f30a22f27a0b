//! Per-window swapchain management: claim, resize, composition, present-mode
//! policy, and the in-flight fence ring that paces frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Error, Result};
use crate::{
    PresentMode, SampleCount, SwapchainComposition, TextureCreateInfo, TextureType, TextureUsage,
    MAX_FRAMES_IN_FLIGHT,
};

use super::fence::FenceInner;
use super::native::swapchain::RawSwapchain;
use super::resource::{Texture, TextureContainer};
use super::DeviceShared;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct WindowInner {
    pub(crate) id: u64,
    size: Mutex<(u32, u32)>,
}

/// A logical window owned by the embedding shell. The core only consumes its
/// size; resizes are observed on the next swapchain acquisition.
#[derive(Clone)]
pub struct Window {
    pub(crate) inner: Arc<WindowInner>,
}

impl Window {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
                size: Mutex::new((width, height)),
            }),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        *self.inner.size.lock().unwrap()
    }

    /// What the shell calls when the OS resizes the window.
    pub fn set_size(&self, width: u32, height: u32) {
        *self.inner.size.lock().unwrap() = (width, height);
    }

    pub(crate) fn is(&self, other: &Window) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("id", &self.inner.id)
            .field("size", &self.size())
            .finish()
    }
}

/// The texture handle plus dimensions returned by a successful acquisition.
#[derive(Debug, Clone)]
pub struct SwapchainTexture {
    pub texture: Texture,
    pub width: u32,
    pub height: u32,
}

pub(crate) struct SwapchainState {
    pub(crate) raw: Arc<RawSwapchain>,
    pub(crate) present_mode: PresentMode,
    pub(crate) composition: SwapchainComposition,
    /// One container per back buffer, `can_be_cycled = false`.
    pub(crate) containers: Vec<Arc<TextureContainer>>,
    /// Weak sense only: the fence most recently used to present each slot.
    pub(crate) in_flight_fences: Vec<Option<Arc<FenceInner>>>,
    /// Back buffers handed to a command buffer that has not presented yet.
    pub(crate) acquired: Vec<bool>,
    pub(crate) frame_counter: usize,
}

pub(crate) struct WindowData {
    pub(crate) window: Window,
    pub(crate) state: Mutex<SwapchainState>,
}

fn back_buffer_info(width: u32, height: u32, composition: SwapchainComposition) -> TextureCreateInfo {
    TextureCreateInfo {
        texture_type: TextureType::D2,
        format: composition.texture_format(),
        usage: TextureUsage::COLOR_TARGET | TextureUsage::SAMPLER,
        width,
        height,
        layer_count_or_depth: 1,
        level_count: 1,
        sample_count: SampleCount::One,
    }
}

fn build_containers(
    device: &Arc<DeviceShared>,
    raw: &Arc<RawSwapchain>,
) -> Vec<Arc<TextureContainer>> {
    let (width, height) = raw.extent();
    let info = back_buffer_info(width, height, raw.composition);
    (0..MAX_FRAMES_IN_FLIGHT as u32)
        .map(|index| {
            TextureContainer::wrap_swapchain(device, raw.back_buffer(index), info.clone())
        })
        .collect()
}

impl SwapchainState {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        window: &Window,
        composition: SwapchainComposition,
        present_mode: PresentMode,
    ) -> Self {
        let (width, height) = window.size();
        let raw = RawSwapchain::new(&device.raw, width, height, composition);
        let containers = build_containers(device, &raw);
        Self {
            raw,
            present_mode,
            composition,
            containers,
            in_flight_fences: vec![None; MAX_FRAMES_IN_FLIGHT],
            acquired: vec![false; MAX_FRAMES_IN_FLIGHT],
            frame_counter: 0,
        }
    }

    /// Rebuilds the back-buffer ring at the window's current size. The
    /// caller has already drained the device, so the old containers' views
    /// go straight back to the staging free lists.
    pub(crate) fn resize(&mut self, device: &Arc<DeviceShared>, width: u32, height: u32) {
        debug!("resizing swapchain to {width}x{height}");
        self.containers.clear();
        self.raw.resize(&device.raw, width, height);
        self.containers = build_containers(device, &self.raw);
        for slot in &mut self.in_flight_fences {
            if let Some(fence) = slot.take() {
                super::fence::release_fence(&fence);
            }
        }
        self.acquired.fill(false);
        self.frame_counter = 0;
    }
}

/// Whether this device can compose in the requested colorspace. The tiled
/// runtime here exposes no PQ colorspace, so HDR10 is rejected.
pub(crate) fn supports_composition(composition: SwapchainComposition) -> bool {
    !matches!(composition, SwapchainComposition::Hdr10)
}

pub(crate) fn supports_present_mode(_mode: PresentMode) -> bool {
    true
}

pub(crate) fn find_window_data(
    device: &DeviceShared,
    window: &Window,
) -> Result<Arc<WindowData>> {
    device
        .claimed_windows
        .lock()
        .unwrap()
        .iter()
        .find(|data| data.window.is(window))
        .cloned()
        .ok_or(Error::WindowNotClaimed)
}
