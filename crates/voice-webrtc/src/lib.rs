//! Peer-connection lifecycle core for a group voice client.
//!
//! One [`PeerSession`] owns one peer connection end to end: microphone
//! acquisition, offer/answer negotiation, candidate buffering, receive-line
//! provisioning, inbound track playback, and the one-shot ICE restart on
//! connection failure. A [`SessionRegistry`] owns the live sessions and
//! routes signaling ([`voice_signal::SignalMessage`]) and platform events to
//! them; lifecycle notifications fan out through an [`EventHub`].
//!
//! The media layer is reached only through the traits in [`platform`]:
//! [`rtc`] implements them on the `webrtc` crate, [`mock`] in memory for
//! tests and single-process wiring.

pub mod allocator;
pub mod config;
pub mod error;
pub mod events;
pub mod mock;
pub mod negotiation;
pub mod platform;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod tracks;

pub use config::{IceServer, OfferSide, VoiceConfig, VoiceConfigBuilder};
pub use error::{VoiceError, VoiceResult};
pub use events::{EventHub, SessionEvent, SubscriptionId, VoiceEvent};
pub use platform::{
    AudioSink, AudioSinkFactory, CaptureStream, ConnectionState, MediaPlatform, PeerEvent,
    PeerEventRx, PeerHandle, SdpKind, TrackId,
};
pub use registry::SessionRegistry;
pub use session::{PeerSession, Role, SessionState};
