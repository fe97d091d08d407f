//! Signaling vocabulary for the group-voice session core.
//!
//! Messages are JSON-shaped and scoped to one logical peer connection by
//! [`SessionId`]. The transport delivering them is abstract: anything that
//! carries named messages to one peer, in arrival order, can implement
//! [`SignalingTransport`]. An in-memory [`LocalSignaling`] pair is provided
//! for tests and single-process topologies.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Identifies one logical peer connection. All signaling messages for a
/// connection carry the same id.
pub type SessionId = String;

/// ICE candidate in the browser `RTCIceCandidateInit` shape, so payloads
/// interoperate with JavaScript peers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Wire vocabulary exchanged over the signaling transport.
///
/// `Ice { candidate: None }` is the end-of-candidates sentinel; receivers
/// consume it without applying anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Ice { candidate: Option<IceCandidate> },
    NegotiationComplete,
    SolicitingTransceiverCount,
    TransceiverCount { count: u32 },
    StartStreaming,
    StopStreaming,
}

impl SignalMessage {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice { .. } => "ice",
            SignalMessage::NegotiationComplete => "negotiation_complete",
            SignalMessage::SolicitingTransceiverCount => "soliciting_transceiver_count",
            SignalMessage::TransceiverCount { .. } => "transceiver_count",
            SignalMessage::StartStreaming => "start_streaming",
            SignalMessage::StopStreaming => "stop_streaming",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
}

pub type SignalResult<T> = Result<T, SignalError>;

/// Per-peer signaling transport. Delivery is in arrival order; duplicates
/// are tolerated by callers (handlers are idempotent-safe).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one message scoped to `session`.
    async fn send(&self, session: &SessionId, message: SignalMessage) -> SignalResult<()>;

    /// Request/response exchange for the authoritative count of receive
    /// lines a subscriber session needs (one per live publisher).
    async fn solicit_transceiver_count(&self, session: &SessionId) -> SignalResult<u32>;
}

/// One endpoint of an in-memory signaling link.
///
/// Outbound messages land on the paired endpoint's inbound queue. The
/// transceiver count is answered locally from a value the test or embedding
/// process keeps current via [`LocalSignaling::set_transceiver_count`].
pub struct LocalSignaling {
    outbound: mpsc::UnboundedSender<(SessionId, SignalMessage)>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<(SessionId, SignalMessage)>>,
    transceiver_counts: parking_lot::Mutex<HashMap<SessionId, u32>>,
}

impl LocalSignaling {
    /// Build a connected pair of endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let left = LocalSignaling {
            outbound: a_tx,
            inbound: AsyncMutex::new(b_rx),
            transceiver_counts: parking_lot::Mutex::new(HashMap::new()),
        };
        let right = LocalSignaling {
            outbound: b_tx,
            inbound: AsyncMutex::new(a_rx),
            transceiver_counts: parking_lot::Mutex::new(HashMap::new()),
        };
        (left, right)
    }

    /// Set the count returned for `session` by `solicit_transceiver_count`.
    pub fn set_transceiver_count(&self, session: &SessionId, count: u32) {
        self.transceiver_counts
            .lock()
            .insert(session.clone(), count);
    }

    /// Receive the next message addressed to this endpoint.
    pub async fn recv(&self) -> Option<(SessionId, SignalMessage)> {
        self.inbound.lock().await.recv().await
    }

    /// Receive without waiting; `None` when the queue is empty.
    pub fn try_recv(&self) -> Option<(SessionId, SignalMessage)> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl SignalingTransport for LocalSignaling {
    async fn send(&self, session: &SessionId, message: SignalMessage) -> SignalResult<()> {
        tracing::trace!(
            target = "voice::signal",
            session = %session,
            kind = message.kind(),
            "sending signal"
        );
        self.outbound
            .send((session.clone(), message))
            .map_err(|_| SignalError::Closed)
    }

    async fn solicit_transceiver_count(&self, session: &SessionId) -> SignalResult<u32> {
        let counts = self.transceiver_counts.lock();
        Ok(counts.get(session).copied().unwrap_or(0))
    }
}
