//! Error types for the duplex voice pipeline.

use serde::Serialize;

/// Microphone / speaker failures, kept distinct so callers can react to a
/// permission problem differently from a missing device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The OS refused access to the capture device.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No matching device exists (or it disappeared).
    #[error("audio device not found: {0}")]
    NotFound(String),

    /// The device exists but cannot provide a usable stream configuration.
    #[error("unsupported device configuration: {0}")]
    Unsupported(String),

    /// The stream failed after it was opened.
    #[error("audio stream error: {0}")]
    Stream(String),
}

impl DeviceError {
    /// Classify a backend-specific message.
    ///
    /// Backends report permission problems only through their message text,
    /// so this is the one place text is inspected.
    pub fn from_backend_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if ["permission", "denied", "not authorized", "not permitted"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::PermissionDenied(message.to_owned())
        } else if ["no such device", "not found", "disconnected"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::NotFound(message.to_owned())
        } else {
            Self::Stream(message.to_owned())
        }
    }
}

impl From<cpal::BackendSpecificError> for DeviceError {
    fn from(err: cpal::BackendSpecificError) -> Self {
        Self::from_backend_message(&err.description)
    }
}

impl From<cpal::DevicesError> for DeviceError {
    fn from(err: cpal::DevicesError) -> Self {
        match err {
            cpal::DevicesError::BackendSpecific { err } => err.into(),
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for DeviceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                Self::NotFound(err.to_string())
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                Self::Unsupported(err.to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { err } => err.into(),
        }
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => Self::NotFound(err.to_string()),
            cpal::BuildStreamError::StreamConfigNotSupported
            | cpal::BuildStreamError::InvalidArgument => Self::Unsupported(err.to_string()),
            cpal::BuildStreamError::StreamIdOverflow => Self::Stream(err.to_string()),
            cpal::BuildStreamError::BackendSpecific { err } => err.into(),
        }
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => Self::NotFound(err.to_string()),
            cpal::PlayStreamError::BackendSpecific { err } => err.into(),
        }
    }
}

/// Top-level error type for the duplex voice system.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Capture or output device error.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Duplex link to the remote speech service failed or dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote service sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl VoiceError {
    /// Coarse classification surfaced to the UI layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Device(DeviceError::PermissionDenied(_)) => ErrorKind::DevicePermission,
            Self::Device(DeviceError::NotFound(_)) => ErrorKind::DeviceMissing,
            Self::Device(_) => ErrorKind::Device,
            Self::Connection(_) | Self::Protocol(_) | Self::Channel(_) => ErrorKind::Connection,
            Self::Config(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may apply its reconnect policy to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_))
    }
}

/// Error categories that cross the component boundary to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Microphone access was refused; the user must grant permission.
    DevicePermission,
    /// No microphone / speaker available.
    DeviceMissing,
    /// Any other device failure.
    Device,
    /// Link to the remote service dropped or the service reported an error.
    Connection,
    /// Capture delivers no real signal, so barge-in has been disabled.
    AnalysisUnavailable,
    /// Local misconfiguration or I/O failure.
    Internal,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_to_distinct_kinds() {
        let denied = VoiceError::from(DeviceError::PermissionDenied("tcc".into()));
        let missing = VoiceError::from(DeviceError::NotFound("usb mic".into()));
        assert_eq!(denied.kind(), ErrorKind::DevicePermission);
        assert_eq!(missing.kind(), ErrorKind::DeviceMissing);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn unplugged_device_is_reported_missing() {
        let build = DeviceError::from(cpal::BuildStreamError::DeviceNotAvailable);
        let play = DeviceError::from(cpal::PlayStreamError::DeviceNotAvailable);
        let config = DeviceError::from(cpal::DefaultStreamConfigError::DeviceNotAvailable);
        for err in [build, play, config] {
            assert!(matches!(err, DeviceError::NotFound(_)), "{err:?}");
            assert_eq!(VoiceError::from(err).kind(), ErrorKind::DeviceMissing);
        }
    }

    #[test]
    fn unsupported_configs_are_distinct() {
        assert!(matches!(
            DeviceError::from(cpal::BuildStreamError::StreamConfigNotSupported),
            DeviceError::Unsupported(_)
        ));
        assert!(matches!(
            DeviceError::from(cpal::DefaultStreamConfigError::StreamTypeNotSupported),
            DeviceError::Unsupported(_)
        ));
    }

    #[test]
    fn backend_messages_fall_back_to_text() {
        let backend = |description: &str| cpal::BackendSpecificError {
            description: description.into(),
        };
        assert!(matches!(
            DeviceError::from(cpal::BuildStreamError::BackendSpecific {
                err: backend("Access denied by the operating system"),
            }),
            DeviceError::PermissionDenied(_)
        ));
        assert!(matches!(
            DeviceError::from(cpal::DevicesError::BackendSpecific {
                err: backend("no such device"),
            }),
            DeviceError::NotFound(_)
        ));
        assert!(matches!(
            DeviceError::from(cpal::PlayStreamError::BackendSpecific {
                err: backend("backend hiccup"),
            }),
            DeviceError::Stream(_)
        ));
    }

    #[test]
    fn connection_errors_are_retryable() {
        let err = VoiceError::Connection("reset by peer".into());
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "connection error: reset by peer");
    }
}
