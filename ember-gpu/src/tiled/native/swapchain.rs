//! Raw swapchain: a ring of back-buffer textures plus the flip index the
//! runtime advances on present.

use std::sync::{Arc, Mutex};

use crate::{SampleCount, SwapchainComposition, TextureFormat, TextureType, TextureUsage, MAX_FRAMES_IN_FLIGHT};

use super::resource::{RawTexture, RawTextureDesc, ResourceState};
use super::RawDevice;

fn back_buffer_desc(width: u32, height: u32, format: TextureFormat) -> RawTextureDesc {
    RawTextureDesc {
        texture_type: TextureType::D2,
        format,
        usage: TextureUsage::COLOR_TARGET | TextureUsage::SAMPLER,
        width,
        height,
        depth: 1,
        layer_count: 1,
        level_count: 1,
        sample_count: SampleCount::One,
    }
}

#[derive(Debug)]
struct Ring {
    textures: Vec<Arc<RawTexture>>,
    current: usize,
    extent: (u32, u32),
}

#[derive(Debug)]
pub(crate) struct RawSwapchain {
    pub(crate) id: u64,
    pub(crate) composition: SwapchainComposition,
    ring: Mutex<Ring>,
}

impl RawSwapchain {
    pub(crate) fn new(
        device: &RawDevice,
        width: u32,
        height: u32,
        composition: SwapchainComposition,
    ) -> Arc<Self> {
        let format = composition.texture_format();
        let textures = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| {
                RawTexture::new(device, back_buffer_desc(width, height, format), ResourceState::Present)
            })
            .collect();
        Arc::new(Self {
            id: device.next_resource_id(),
            composition,
            ring: Mutex::new(Ring { textures, current: 0, extent: (width, height) }),
        })
    }

    pub(crate) fn extent(&self) -> (u32, u32) {
        self.ring.lock().unwrap().extent
    }

    /// Drops the old back-buffer ring and commits a fresh one at the new
    /// extent. The caller must have drained the GPU first.
    pub(crate) fn resize(&self, device: &RawDevice, width: u32, height: u32) {
        let format = self.composition.texture_format();
        let mut ring = self.ring.lock().unwrap();
        ring.textures = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| {
                RawTexture::new(device, back_buffer_desc(width, height, format), ResourceState::Present)
            })
            .collect();
        ring.current = 0;
        ring.extent = (width, height);
    }

    pub(crate) fn back_buffer_index(&self) -> u32 {
        self.ring.lock().unwrap().current as u32
    }

    pub(crate) fn back_buffer(&self, index: u32) -> Arc<RawTexture> {
        Arc::clone(&self.ring.lock().unwrap().textures[index as usize])
    }

    /// Flips to the next back buffer.
    pub(crate) fn present(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.current = (ring.current + 1) % ring.textures.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_cycles_the_ring() {
        let device = RawDevice::new(false, 0);
        let swapchain = RawSwapchain::new(&device, 64, 64, SwapchainComposition::Sdr);
        assert_eq!(swapchain.back_buffer_index(), 0);
        swapchain.present();
        assert_eq!(swapchain.back_buffer_index(), 1);
        swapchain.present();
        assert_eq!(swapchain.back_buffer_index(), 0);
    }

    #[test]
    fn resize_rebuilds_the_ring_at_the_new_extent() {
        let device = RawDevice::new(false, 0);
        let swapchain = RawSwapchain::new(&device, 800, 600, SwapchainComposition::Sdr);
        swapchain.present();
        swapchain.resize(&device, 1024, 768);
        assert_eq!(swapchain.extent(), (1024, 768));
        assert_eq!(swapchain.back_buffer_index(), 0);
        assert_eq!(swapchain.back_buffer(0).desc.width, 1024);
    }
}
