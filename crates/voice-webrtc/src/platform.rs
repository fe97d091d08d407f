//! Interfaces to the platform media layer.
//!
//! The underlying capture, codec, and encryption machinery is an external
//! collaborator assumed correct; sessions drive it only through these traits.
//! Platform events reach the session as messages on a channel, never as
//! ambient callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voice_signal::IceCandidate;

use crate::config::VoiceConfig;
use crate::error::VoiceResult;

/// Identity of one media track, as reported by the platform.
pub type TrackId = String;

/// Peer connection state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from one peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(ConnectionState),
    /// A locally gathered candidate; `None` marks end of gathering and is
    /// forwarded on the wire as the null sentinel.
    LocalCandidate(Option<IceCandidate>),
    TrackAdded { track_id: TrackId, stream_id: String },
    TrackEnded { track_id: TrackId },
}

pub type PeerEventRx = mpsc::UnboundedReceiver<PeerEvent>;

/// Kind of a session description being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Entry point into the platform: capture acquisition and peer construction.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Acquire the microphone. Denial surfaces as
    /// [`VoiceError::CaptureDeviceDenied`](crate::VoiceError::CaptureDeviceDenied)
    /// and must leave nothing behind.
    async fn acquire_microphone(&self) -> VoiceResult<Arc<dyn CaptureStream>>;

    /// Create one peer connection plus the channel its events arrive on.
    async fn create_peer(
        &self,
        config: &VoiceConfig,
    ) -> VoiceResult<(Arc<dyn PeerHandle>, PeerEventRx)>;
}

/// A captured microphone stream. Released exactly once; `stop` is idempotent.
pub trait CaptureStream: Send + Sync {
    fn id(&self) -> &str;
    fn stop(&self);
}

/// One platform peer connection.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Produce an offer description. `ice_restart` requests fresh credentials
    /// for connection recovery without tearing the session down.
    async fn create_offer(&self, ice_restart: bool) -> VoiceResult<String>;

    async fn create_answer(&self) -> VoiceResult<String>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> VoiceResult<()>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> VoiceResult<()>;

    /// Apply one remote candidate. Callers guarantee the remote description
    /// is already set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> VoiceResult<()>;

    /// Provision one receive-only audio line.
    async fn add_recv_transceiver(&self) -> VoiceResult<()>;

    /// Attach the captured stream as the single outbound audio track.
    async fn publish_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()>;

    /// Swap the outbound track without renegotiation.
    async fn replace_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()>;

    /// Enable or disable the outbound track without renegotiation.
    async fn set_outbound_enabled(&self, enabled: bool) -> VoiceResult<()>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Creates playback sinks for inbound tracks.
pub trait AudioSinkFactory: Send + Sync {
    fn attach(&self, track_id: &str, stream_id: &str) -> Arc<dyn AudioSink>;
}

/// Playback sink for one remote track. Detached exactly once when the track
/// ends or the session closes.
pub trait AudioSink: Send + Sync {
    fn set_muted(&self, muted: bool);
    fn detach(&self);
}
