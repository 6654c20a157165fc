use crate::types::Method;

/// Vendor-assigned device identity (the `id:` advertisement header).
pub type DeviceId = String;

/// All error types that can occur when talking to lights.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Command arguments were malformed or out of range; nothing was sent.
    #[error("invalid command: {0}")]
    Validation(String),

    /// The device has no live session and the offline policy is fail-fast.
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    /// The offline queue of the device is full.
    #[error("offline queue of device {0} is full")]
    QueueFull(DeviceId),

    /// The session dropped while the command was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// No matching response arrived before the command deadline.
    #[error("command timed out")]
    Timeout,

    /// The device answered with an explicit error object.
    #[error("device error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// A structurally unexpected payload.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The device did not declare support for the method.
    #[error("device {device} does not support {method}")]
    Unsupported { device: DeviceId, method: Method },

    /// No device with this identity is known.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// The connection was removed by its owner.
    #[error("connection closed")]
    Closed,

    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(serde_json::Error),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation(reason.into())
    }

    /// Create a new protocol error
    pub fn protocol(code: i64, message: &str) -> Self {
        Error::Protocol {
            code,
            message: message.to_string(),
        }
    }

    /// Create a new unsupported method error
    pub fn unsupported(device: &str, method: Method) -> Self {
        Error::Unsupported {
            device: device.to_string(),
            method,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
