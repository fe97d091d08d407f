//! In-memory platform doubles for tests and single-process wiring.
//!
//! [`MockPeer`] records every operation and rejects candidates applied
//! before a remote description, so tests catch ordering violations without
//! OS networking.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;
use voice_signal::IceCandidate;

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::platform::{
    AudioSink, AudioSinkFactory, CaptureStream, MediaPlatform, PeerEvent, PeerEventRx, PeerHandle,
    SdpKind,
};

/// Operation recorded by [`MockPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    AddRecvTransceiver,
    PublishTrack(String),
    ReplaceTrack(String),
    SetOutboundEnabled(bool),
    Close,
}

pub struct MockPlatform {
    deny_microphone: AtomicBool,
    captures: Mutex<Vec<Arc<MockCapture>>>,
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_microphone: AtomicBool::new(false),
            captures: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Make subsequent microphone acquisitions fail.
    pub fn deny_microphone(&self, deny: bool) {
        self.deny_microphone.store(deny, Ordering::SeqCst);
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn captures(&self) -> Vec<Arc<MockCapture>> {
        self.captures.lock().clone()
    }
}

#[async_trait]
impl MediaPlatform for MockPlatform {
    async fn acquire_microphone(&self) -> VoiceResult<Arc<dyn CaptureStream>> {
        // Suspend once, as a real permission prompt would, so overlapping
        // starts interleave in tests.
        tokio::task::yield_now().await;
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(VoiceError::CaptureDeviceDenied(
                "permission denied by user".into(),
            ));
        }
        let capture = Arc::new(MockCapture {
            id: Uuid::new_v4().to_string(),
            stopped: AtomicBool::new(false),
        });
        self.captures.lock().push(capture.clone());
        Ok(capture)
    }

    async fn create_peer(
        &self,
        _config: &VoiceConfig,
    ) -> VoiceResult<(Arc<dyn PeerHandle>, PeerEventRx)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeer {
            ops: Mutex::new(Vec::new()),
            events_tx,
            offer_seq: AtomicU32::new(0),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            applied_candidates: Mutex::new(Vec::new()),
            recv_transceivers: AtomicU32::new(0),
            outbound_enabled: AtomicBool::new(true),
        });
        self.peers.lock().push(peer.clone());
        Ok((peer, events_rx))
    }
}

pub struct MockCapture {
    id: String,
    stopped: AtomicBool,
}

impl MockCapture {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureStream for MockCapture {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    ops: Mutex<Vec<PeerOp>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    offer_seq: AtomicU32,
    remote_set: AtomicBool,
    closed: AtomicBool,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    recv_transceivers: AtomicU32,
    outbound_enabled: AtomicBool,
}

impl MockPeer {
    /// Inject a platform event, as the real peer connection would.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    pub fn recv_transceivers(&self) -> u32 {
        self.recv_transceivers.load(Ordering::SeqCst)
    }

    pub fn offers_created(&self) -> u32 {
        self.offer_seq.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn outbound_enabled(&self) -> bool {
        self.outbound_enabled.load(Ordering::SeqCst)
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PeerHandle for MockPeer {
    async fn create_offer(&self, ice_restart: bool) -> VoiceResult<String> {
        self.record(PeerOp::CreateOffer { ice_restart });
        let seq = self.offer_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 mock-offer-{seq}"))
    }

    async fn create_answer(&self) -> VoiceResult<String> {
        self.record(PeerOp::CreateAnswer);
        Ok("v=0 mock-answer".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, _sdp: String) -> VoiceResult<()> {
        self.record(PeerOp::SetLocal(kind));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: String) -> VoiceResult<()> {
        self.record(PeerOp::SetRemote(kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> VoiceResult<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(VoiceError::Platform(
                "candidate applied before remote description".into(),
            ));
        }
        self.record(PeerOp::AddCandidate(candidate.candidate.clone()));
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_recv_transceiver(&self) -> VoiceResult<()> {
        self.record(PeerOp::AddRecvTransceiver);
        self.recv_transceivers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()> {
        self.record(PeerOp::PublishTrack(stream.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()> {
        self.record(PeerOp::ReplaceTrack(stream.id().to_string()));
        Ok(())
    }

    async fn set_outbound_enabled(&self, enabled: bool) -> VoiceResult<()> {
        self.record(PeerOp::SetOutboundEnabled(enabled));
        self.outbound_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.record(PeerOp::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Sink factory that records attach/detach pairing for assertions.
#[derive(Default)]
pub struct RecordingSinkFactory {
    sinks: Mutex<Vec<(String, Arc<RecordingSink>)>>,
}

impl RecordingSinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sink_for(&self, track_id: &str) -> Option<Arc<RecordingSink>> {
        self.sinks
            .lock()
            .iter()
            .find(|(id, _)| id == track_id)
            .map(|(_, sink)| sink.clone())
    }

    pub fn attached_total(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.sinks
            .lock()
            .iter()
            .filter(|(_, sink)| !sink.is_detached())
            .count()
    }
}

impl AudioSinkFactory for RecordingSinkFactory {
    fn attach(&self, track_id: &str, _stream_id: &str) -> Arc<dyn AudioSink> {
        let sink = Arc::new(RecordingSink::default());
        self.sinks.lock().push((track_id.to_string(), sink.clone()));
        sink
    }
}

#[derive(Default)]
pub struct RecordingSink {
    muted: AtomicBool,
    detach_calls: AtomicUsize,
}

impl RecordingSink {
    pub fn is_detached(&self) -> bool {
        self.detach_calls.load(Ordering::SeqCst) > 0
    }

    pub fn detach_calls(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingSink {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
    }
}
