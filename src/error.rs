use std::time::Duration;

use thiserror::Error;

/// Failure classes surfaced by the install engine.
///
/// Variants travel inside [`anyhow::Error`] so call sites keep their context
/// chains while callers can still classify a failure with `downcast_ref`.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The caller handed us something unusable: an empty gadget root, a
    /// gadget without the required role, a pre-modes model.
    #[error("{0}")]
    BadInput(String),

    /// The gadget description is malformed or internally inconsistent.
    #[error("invalid gadget layout: {0}")]
    LayoutInvalid(String),

    /// The declared layout cannot be reconciled with the probed disk.
    #[error("gadget and {device} partition table not compatible: {reason}")]
    IncompatibleLayout { device: String, reason: String },

    /// An expected device node or symlink is absent.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The disk carries a partition table we cannot work with.
    #[error("partition table schema {0:?} is not supported")]
    UnsupportedSchema(String),

    /// An external tool (partitioner, mkfs, cryptsetup, udevadm) exited
    /// non-zero.
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Waiting for freshly created device nodes ran out of time.
    #[error("timed out after {0:?} waiting for device nodes to appear")]
    Timeout(Duration),

    /// The requested encryption scheme is not implemented here.
    #[error("unsupported encryption type {0:?}")]
    UnsupportedEncryption(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
