use thiserror::Error;
use voice_signal::{SessionId, SignalError};

/// Error taxonomy for the voice session core.
///
/// Transient transport and platform failures are absorbed inside the session
/// (logged, retried, or answered with an ICE restart); only resource
/// acquisition and invariant violations surface to the caller.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// A session for this identity is already live.
    #[error("session {0} is already active")]
    AlreadyActive(SessionId),

    /// An answer or candidate arrived with no matching live negotiation.
    /// Sessions log and drop these; the variant exists for callers that
    /// route signals themselves.
    #[error("stale signal: {0}")]
    StaleSignal(&'static str),

    /// Microphone acquisition failed or was denied. The session is never
    /// created and no partial state remains.
    #[error("capture device denied: {0}")]
    CaptureDeviceDenied(String),

    /// Negotiation failed terminally, after the one automatic ICE restart.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The server asked for fewer receive lines than are provisioned.
    /// Reported as a defect, never silently clamped.
    #[error("allocator invariant violated: desired {desired} < provisioned {provisioned}")]
    AllocatorInvariant { desired: u32, provisioned: u32 },

    /// Failure inside the platform media layer.
    #[error("platform error: {0}")]
    Platform(String),

    #[error(transparent)]
    Signaling(#[from] SignalError),
}

pub type VoiceResult<T> = Result<T, VoiceError>;
