//! Error type shared by every fallible creation-shaped operation.
//!
//! The per-frame hot path does not surface errors as control flow: it logs
//! through the `log` facade and returns `None`/`false` (descriptor
//! exhaustion, swapchain parameter rejection, skipped mailbox frames).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing driver, unsupported feature level, no suitable adapter.
    #[error("device initialization failed: {0}")]
    Initialization(String),

    /// Out-of-memory or an invalid create-info (e.g. unsupported depth format).
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// Shader bytecode did not match the backend's declared format.
    #[error("invalid shader bytecode: {0}")]
    InvalidBytecode(String),

    /// The window was not claimed, or was claimed by another device.
    #[error("window is not claimed by this device")]
    WindowNotClaimed,

    /// Requested composition or colorspace is unsupported on this device.
    #[error("unsupported swapchain composition")]
    UnsupportedComposition,

    /// Requested present mode is unsupported on this device.
    #[error("unsupported present mode")]
    UnsupportedPresentMode,

    /// The driver reported a device-removed status. No recovery is attempted;
    /// subsequent submits keep failing noisily until the device is destroyed.
    #[error("device removed: {0}")]
    DeviceRemoved(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
