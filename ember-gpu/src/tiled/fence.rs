//! Pooled fences.
//!
//! A fence signals from 0 to 1 when its submission completes. The owning
//! command buffer holds one reference and every window whose present
//! recorded the fence holds another; the fence returns to the device pool,
//! reset, when the count reaches zero.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use super::native::RawFence;
use super::DeviceShared;

pub(crate) struct FenceInner {
    device: Weak<DeviceShared>,
    pub(crate) raw: Arc<RawFence>,
    ref_count: AtomicU32,
}

impl FenceInner {
    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Drops one reference; the last one resets the fence and returns it to the
/// pool.
pub(crate) fn release_fence(fence: &Arc<FenceInner>) {
    if fence.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(device) = fence.device.upgrade() {
            fence.raw.reset();
            device.available_fences.lock().unwrap().push(Arc::clone(fence));
        }
    }
}

impl std::fmt::Debug for FenceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("completed", &self.raw.completed())
            .field("refs", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pops the device's fence pool, or creates an unsignalled fence when the
/// pool is empty. The caller takes the first reference.
pub(crate) fn acquire_fence(device: &Arc<DeviceShared>) -> Arc<FenceInner> {
    let pooled = device.available_fences.lock().unwrap().pop();
    let fence = pooled.unwrap_or_else(|| {
        Arc::new(FenceInner {
            device: Arc::downgrade(device),
            raw: Arc::new(RawFence::new()),
            ref_count: AtomicU32::new(0),
        })
    });
    fence.add_ref();
    fence
}

/// Client-owned fence handle, returned by
/// [`CommandBuffer::submit_and_acquire_fence`](super::CommandBuffer::submit_and_acquire_fence).
/// Dropping it releases the reference the submit transferred to the caller.
pub struct Fence {
    pub(crate) inner: Arc<FenceInner>,
}

impl Fence {
    pub(crate) fn new(inner: Arc<FenceInner>) -> Self {
        Self { inner }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        release_fence(&self.inner);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
