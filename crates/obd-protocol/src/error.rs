//! OBD-II Error Types

use crate::frame::FrameError;
use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// The serial device could not be opened; fatal to that session
    #[error("Failed to open serial port {device}: {message}")]
    Open { device: String, message: String },

    /// Serial port I/O error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Adapter kept sending bytes without a delimiter
    #[error(transparent)]
    Framing(#[from] FrameError),

    /// The session worker has stopped
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Text that is not a canonical trouble code
    #[error("Invalid DTC code: {0}")]
    InvalidDtc(String),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_maps_to_serial_error() {
        let err: ObdError = io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled").into();
        assert!(matches!(err, ObdError::SerialError(ref m) if m == "cable pulled"));
    }

    #[test]
    fn test_framing_error_is_transparent() {
        let err = ObdError::from(FrameError::Overflow {
            limit: 8,
            frames: vec!["41 0D 5A".to_string()],
        });
        assert_eq!(
            err.to_string(),
            "Framing overflow: more than 8 bytes without a delimiter"
        );
    }
}
