/// Errors surfaced by the multiplexer and its hardware surface.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::CameraError;
///
/// let err = CameraError::UnknownBuffer(7);
/// assert_eq!(err.code(), "unknown_buffer");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("another client currently holds exclusive control")]
    OwnershipLost,
    #[error("no buffer available for delivery")]
    BufferUnavailable,
    #[error("hardware refused the operation: {0}")]
    Underlying(String),
    #[error("fence-based delivery is not enabled for this client")]
    SyncUnsupported,
    #[error("stream is already running")]
    StreamAlreadyRunning,
    #[error("stream is not running")]
    NotStreaming,
    #[error("unknown buffer id {0}")]
    UnknownBuffer(u32),
}

impl CameraError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CameraError::InvalidArg => "invalid_arg",
            CameraError::OwnershipLost => "ownership_lost",
            CameraError::BufferUnavailable => "buffer_unavailable",
            CameraError::Underlying(_) => "underlying",
            CameraError::SyncUnsupported => "sync_unsupported",
            CameraError::StreamAlreadyRunning => "stream_already_running",
            CameraError::NotStreaming => "not_streaming",
            CameraError::UnknownBuffer(_) => "unknown_buffer",
        }
    }

    /// Whether the operation may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CameraError::Underlying(_) | CameraError::BufferUnavailable
        )
    }
}
