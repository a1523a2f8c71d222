//! Error types for the tlstap userspace side

use thiserror::Error;

/// Errors raised while loading, attaching or draining the capture program.
///
/// These only ever surface at startup or in the consumer; the interceptors
/// themselves have no error path.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// eBPF bytecode could not be located or read
    #[error("eBPF bytecode not available: {0}")]
    Bytecode(String),

    /// No SSL library to attach to
    #[error("No SSL library found for uprobe attachment")]
    NoSslLibrary,

    /// Loading the object into the kernel failed
    #[error("Failed to load eBPF program: {0}")]
    Load(String),

    /// A program is missing from the object or failed to attach
    #[error("Failed to attach {program}: {message}")]
    Attach { program: String, message: String },

    /// A map is missing from the object or has the wrong type
    #[error("Map {map} unavailable: {message}")]
    Map { map: String, message: String },

    /// Capture was started twice
    #[error("Capture already running")]
    AlreadyRunning,

    /// Capture is only implemented on Linux
    #[error("eBPF capture is not supported on this platform")]
    Unsupported,
}

impl CaptureError {
    pub fn attach(program: impl Into<String>, message: impl ToString) -> Self {
        CaptureError::Attach {
            program: program.into(),
            message: message.to_string(),
        }
    }

    pub fn map(map: impl Into<String>, message: impl ToString) -> Self {
        CaptureError::Map {
            map: map.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying with elevated privileges could help
    pub fn is_permission_error(&self) -> bool {
        match self {
            CaptureError::Load(message) | CaptureError::Attach { message, .. } => {
                let message = message.to_ascii_lowercase();
                message.contains("permission") || message.contains("operation not permitted")
            }
            _ => false,
        }
    }
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors decoding a raw record drained from the event channel
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record too short: {got} bytes, expected {expected}")]
    TooShort { got: usize, expected: usize },

    #[error("Unknown call kind: {0}")]
    UnknownKind(u8),

    #[error("Inconsistent lengths: captured {captured}, reported {reported}")]
    BadLength { captured: u32, reported: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_permission_error() {
        assert!(CaptureError::Load("Operation not permitted (os error 1)".into())
            .is_permission_error());
        assert!(CaptureError::attach("ssl_read", "permission denied").is_permission_error());
        assert!(!CaptureError::NoSslLibrary.is_permission_error());
        assert!(!CaptureError::attach("ssl_read", "symbol not found").is_permission_error());
    }

    #[test]
    fn test_display() {
        let err = CaptureError::attach("ssl_write_ret", "no such symbol");
        assert_eq!(err.to_string(), "Failed to attach ssl_write_ret: no such symbol");

        let err = DecodeError::TooShort {
            got: 3,
            expected: 8,
        };
        assert_eq!(err.to_string(), "Record too short: 3 bytes, expected 8");
    }
}
