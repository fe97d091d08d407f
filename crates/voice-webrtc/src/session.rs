//! One peer connection, one role, one owner for everything it needs.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use voice_signal::{IceCandidate, SessionId, SignalMessage, SignalingTransport};

use crate::allocator::TransceiverAllocator;
use crate::config::{OfferSide, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventHub, SessionEvent, VoiceEvent};
use crate::negotiation::{CandidateBuffer, NegotiationState};
use crate::platform::{
    AudioSinkFactory, CaptureStream, ConnectionState, MediaPlatform, PeerEvent, PeerEventRx,
    PeerHandle, SdpKind,
};
use crate::tracks::TrackLifecycle;

/// What this end of the connection does with audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns exactly one outbound microphone track, no inbound tracks.
    Publisher,
    /// Owns zero or more inbound tracks, no outbound tracks.
    Subscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// Aggregate owning one peer connection and its negotiation machinery.
///
/// All operations are non-blocking handlers; the registry serializes them
/// per session, so none interleaves with itself. Platform results that
/// resolve after `stop` are discarded as no-ops.
pub struct PeerSession {
    id: SessionId,
    role: Role,
    config: VoiceConfig,
    platform: Arc<dyn MediaPlatform>,
    signaling: Arc<dyn SignalingTransport>,
    events: Arc<EventHub>,
    state: SessionState,
    peer: Option<Arc<dyn PeerHandle>>,
    capture: Option<Arc<dyn CaptureStream>>,
    // True once the remote end has been told streaming started; gates the
    // matching stop notification.
    streaming_announced: bool,
    peer_events: Option<PeerEventRx>,
    negotiation: NegotiationState,
    candidates: CandidateBuffer,
    allocator: TransceiverAllocator,
    tracks: TrackLifecycle,
}

impl PeerSession {
    pub fn new(
        id: SessionId,
        role: Role,
        config: VoiceConfig,
        platform: Arc<dyn MediaPlatform>,
        signaling: Arc<dyn SignalingTransport>,
        sink_factory: Arc<dyn AudioSinkFactory>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            id,
            role,
            config,
            platform,
            signaling,
            events,
            state: SessionState::New,
            peer: None,
            capture: None,
            streaming_announced: false,
            peer_events: None,
            negotiation: NegotiationState::new(),
            candidates: CandidateBuffer::new(),
            allocator: TransceiverAllocator::new(),
            tracks: TrackLifecycle::new(sink_factory),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn live_sink_count(&self) -> usize {
        self.tracks.live_count()
    }

    pub fn provisioned_transceivers(&self) -> u32 {
        self.allocator.provisioned()
    }

    /// Hand the platform event stream to whoever pumps it (the registry).
    pub fn take_peer_events(&mut self) -> Option<PeerEventRx> {
        self.peer_events.take()
    }

    /// Acquire resources and open the first negotiation round. On failure,
    /// everything acquired so far is released before the error returns.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.peer.is_some() || self.state != SessionState::New {
            return Err(VoiceError::AlreadyActive(self.id.clone()));
        }
        if let Err(err) = self.open().await {
            self.teardown().await;
            self.negotiation = NegotiationState::new();
            self.allocator = TransceiverAllocator::new();
            self.state = SessionState::New;
            return Err(err);
        }
        self.publish(SessionEvent::Started);
        Ok(())
    }

    async fn open(&mut self) -> VoiceResult<()> {
        match self.role {
            Role::Publisher => self.start_publisher().await?,
            Role::Subscriber => self.start_subscriber().await?,
        }
        if self.config.offer_side == OfferSide::Local {
            self.send_offer(false).await
        } else {
            // The remote end offers; wait for it.
            self.state = SessionState::Negotiating;
            Ok(())
        }
    }

    async fn start_publisher(&mut self) -> VoiceResult<()> {
        // Microphone first: if the user denies it, nothing else exists yet.
        // Everything acquired after this point is stored immediately, so a
        // failed start releases it through `teardown`.
        let capture = self.platform.acquire_microphone().await?;
        info!(
            target = "voice::session",
            session = %self.id,
            stream = capture.id(),
            "microphone stream acquired"
        );
        self.capture = Some(capture.clone());
        let (peer, peer_events) = self.platform.create_peer(&self.config).await?;
        self.peer = Some(peer.clone());
        self.peer_events = Some(peer_events);
        peer.publish_track(capture).await?;
        self.signaling
            .send(&self.id, SignalMessage::StartStreaming)
            .await?;
        self.streaming_announced = true;
        Ok(())
    }

    async fn start_subscriber(&mut self) -> VoiceResult<()> {
        // Ask for the authoritative publisher count before offering, so one
        // round covers every current publisher.
        let desired = self.signaling.solicit_transceiver_count(&self.id).await?;
        debug!(
            target = "voice::session",
            session = %self.id,
            desired,
            "transceiver count received"
        );
        let (peer, peer_events) = self.platform.create_peer(&self.config).await?;
        self.peer = Some(peer.clone());
        self.peer_events = Some(peer_events);
        self.provision_receive_lines(&peer, desired).await?;
        Ok(())
    }

    async fn provision_receive_lines(
        &mut self,
        peer: &Arc<dyn PeerHandle>,
        desired: u32,
    ) -> VoiceResult<u32> {
        let missing = self.allocator.reconcile(desired)?;
        for _ in 0..missing {
            peer.add_recv_transceiver().await?;
        }
        self.allocator.mark_provisioned(missing);
        Ok(missing)
    }

    /// Tear everything down. Idempotent and safe from any state, including a
    /// session that never started.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Closed {
            trace!(target = "voice::session", session = %self.id, "stop on closed session");
            return;
        }
        if self.state == SessionState::New && self.peer.is_none() {
            self.state = SessionState::Closed;
            return;
        }
        info!(target = "voice::session", session = %self.id, "stopping session");
        self.teardown().await;
        self.state = SessionState::Closed;
        self.publish(SessionEvent::Stopped);
    }

    async fn teardown(&mut self) {
        let was_streaming = self.streaming_announced;
        self.streaming_announced = false;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(capture) = self.capture.take() {
            debug!(
                target = "voice::session",
                session = %self.id,
                stream = capture.id(),
                "releasing capture stream"
            );
            capture.stop();
        }
        self.tracks.detach_all();
        self.candidates.clear();
        self.peer_events = None;
        if was_streaming {
            if let Err(err) = self
                .signaling
                .send(&self.id, SignalMessage::StopStreaming)
                .await
            {
                debug!(
                    target = "voice::session",
                    session = %self.id,
                    error = %err,
                    "stop notification not delivered"
                );
            }
        }
    }

    /// Process one signaling message addressed to this session.
    pub async fn handle_signal(&mut self, message: SignalMessage) -> VoiceResult<()> {
        if self.state == SessionState::Closed {
            warn!(
                target = "voice::session",
                session = %self.id,
                kind = message.kind(),
                "signal for closed session dropped"
            );
            return Ok(());
        }
        match message {
            SignalMessage::Offer { sdp } => self.apply_remote_offer(sdp).await,
            SignalMessage::Answer { sdp } => self.apply_remote_answer(sdp).await,
            SignalMessage::Ice { candidate } => self.apply_remote_candidate(candidate).await,
            SignalMessage::NegotiationComplete => {
                debug!(
                    target = "voice::session",
                    session = %self.id,
                    "remote closed the negotiation round"
                );
                self.publish(SessionEvent::NegotiationComplete);
                Ok(())
            }
            SignalMessage::TransceiverCount { count } => self.reconcile_transceivers(count).await,
            other => {
                trace!(
                    target = "voice::session",
                    session = %self.id,
                    kind = other.kind(),
                    "control message ignored"
                );
                Ok(())
            }
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> VoiceResult<()> {
        let peer = self
            .peer
            .clone()
            .ok_or_else(|| VoiceError::NegotiationFailed("no live peer connection".into()))?;
        self.negotiation.begin_offer_round(ice_restart)?;
        let sdp = peer.create_offer(ice_restart).await?;
        peer.set_local_description(SdpKind::Offer, sdp.clone()).await?;
        self.negotiation.mark_local_applied();
        self.state = SessionState::Negotiating;
        debug!(
            target = "voice::session",
            session = %self.id,
            ice_restart,
            "sending offer"
        );
        self.signaling
            .send(&self.id, SignalMessage::Offer { sdp })
            .await?;
        Ok(())
    }

    async fn apply_remote_offer(&mut self, sdp: String) -> VoiceResult<()> {
        let Some(peer) = self.peer.clone() else {
            warn!(
                target = "voice::session",
                session = %self.id,
                "offer received but there is no peer connection, ignoring"
            );
            return Ok(());
        };
        if self.negotiation.awaiting_answer() {
            // Glare: our own offer is still unanswered. The configured
            // topology says the remote should not offer, so drop theirs.
            warn!(
                target = "voice::session",
                session = %self.id,
                "offer received while awaiting answer, dropping"
            );
            return Ok(());
        }
        self.negotiation.begin_answer_round();
        peer.set_remote_description(SdpKind::Offer, sdp).await?;
        self.negotiation.mark_remote_applied();
        self.flush_candidates(&peer).await;
        let answer = peer.create_answer().await?;
        peer.set_local_description(SdpKind::Answer, answer.clone())
            .await?;
        self.negotiation.mark_local_applied();
        self.state = SessionState::Negotiating;
        debug!(target = "voice::session", session = %self.id, "sending answer");
        self.signaling
            .send(&self.id, SignalMessage::Answer { sdp: answer })
            .await?;
        // The offerer closes the round on the wire; locally both
        // descriptions are in place, so note the completion here.
        if self.negotiation.try_signal_complete() {
            self.publish(SessionEvent::NegotiationComplete);
        }
        Ok(())
    }

    async fn apply_remote_answer(&mut self, sdp: String) -> VoiceResult<()> {
        let Some(peer) = self.peer.clone() else {
            warn!(
                target = "voice::session",
                session = %self.id,
                "answer received but there is no peer connection, ignoring"
            );
            return Ok(());
        };
        if !self.negotiation.awaiting_answer() {
            // The remote may have retried; non-fatal.
            warn!(
                target = "voice::session",
                session = %self.id,
                "answer received with no outstanding offer, ignoring"
            );
            return Ok(());
        }
        peer.set_remote_description(SdpKind::Answer, sdp).await?;
        self.negotiation.mark_remote_applied();
        self.flush_candidates(&peer).await;
        if self.negotiation.try_signal_complete() {
            debug!(
                target = "voice::session",
                session = %self.id,
                "negotiation round complete"
            );
            self.signaling
                .send(&self.id, SignalMessage::NegotiationComplete)
                .await?;
            self.publish(SessionEvent::NegotiationComplete);
        }
        Ok(())
    }

    async fn apply_remote_candidate(&mut self, candidate: Option<IceCandidate>) -> VoiceResult<()> {
        let Some(candidate) = candidate else {
            trace!(
                target = "voice::session",
                session = %self.id,
                "remote end of candidates"
            );
            return Ok(());
        };
        let Some(peer) = self.peer.clone() else {
            warn!(
                target = "voice::session",
                session = %self.id,
                "candidate received but there is no peer connection, ignoring"
            );
            return Ok(());
        };
        if self.negotiation.remote_applied() {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(
                    target = "voice::session",
                    session = %self.id,
                    error = %err,
                    "failed to apply remote candidate"
                );
            }
        } else {
            self.candidates.push(candidate);
            trace!(
                target = "voice::session",
                session = %self.id,
                queued = self.candidates.len(),
                "buffered candidate until remote description"
            );
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerHandle>) {
        let queued = self.candidates.drain();
        if queued.is_empty() {
            return;
        }
        debug!(
            target = "voice::session",
            session = %self.id,
            count = queued.len(),
            "flushing buffered candidates"
        );
        for candidate in queued {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(
                    target = "voice::session",
                    session = %self.id,
                    error = %err,
                    "failed to apply buffered candidate"
                );
            }
        }
    }

    async fn reconcile_transceivers(&mut self, count: u32) -> VoiceResult<()> {
        if self.role != Role::Subscriber {
            warn!(
                target = "voice::session",
                session = %self.id,
                "transceiver count for a publisher session, ignoring"
            );
            return Ok(());
        }
        let Some(peer) = self.peer.clone() else {
            warn!(
                target = "voice::session",
                session = %self.id,
                "transceiver count but there is no peer connection, ignoring"
            );
            return Ok(());
        };
        let missing = self.provision_receive_lines(&peer, count).await?;
        if missing == 0 {
            trace!(
                target = "voice::session",
                session = %self.id,
                count,
                "receive lines already provisioned"
            );
            return Ok(());
        }
        debug!(
            target = "voice::session",
            session = %self.id,
            added = missing,
            "receive lines added, renegotiating"
        );
        if self.config.offer_side == OfferSide::Local {
            self.send_offer(false).await?;
        }
        Ok(())
    }

    /// Process one platform event. Events that resolve against a stopped
    /// session are discarded.
    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        if self.peer.is_none() {
            trace!(
                target = "voice::session",
                session = %self.id,
                "platform event after teardown discarded"
            );
            return;
        }
        match event {
            PeerEvent::ConnectionState(state) => self.on_connection_state(state).await,
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(err) = self
                    .signaling
                    .send(&self.id, SignalMessage::Ice { candidate })
                    .await
                {
                    warn!(
                        target = "voice::session",
                        session = %self.id,
                        error = %err,
                        "failed to emit local candidate"
                    );
                }
            }
            PeerEvent::TrackAdded {
                track_id,
                stream_id,
            } => {
                if self.tracks.on_track_added(&track_id, &stream_id) {
                    self.publish(SessionEvent::TrackStarted(track_id));
                }
            }
            PeerEvent::TrackEnded { track_id } => {
                if self.tracks.on_track_ended(&track_id) {
                    self.publish(SessionEvent::TrackEnded(track_id));
                }
            }
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!(target = "voice::session", session = %self.id, "peer connection connected");
                self.state = SessionState::Connected;
                self.publish(SessionEvent::Connected);
            }
            ConnectionState::Failed => self.on_connection_failed().await,
            other => {
                trace!(
                    target = "voice::session",
                    session = %self.id,
                    state = ?other,
                    "connection state changed"
                );
            }
        }
    }

    async fn on_connection_failed(&mut self) {
        if !self.negotiation.take_restart(self.config.restart_limit) {
            warn!(
                target = "voice::session",
                session = %self.id,
                restarts = self.negotiation.restarts_used(),
                "connection failed with restart budget spent, closing"
            );
            self.fail_terminally().await;
            return;
        }
        info!(
            target = "voice::session",
            session = %self.id,
            "peer connection failed, restarting ICE"
        );
        self.publish(SessionEvent::IceRestarted);
        if let Err(err) = self.send_offer(true).await {
            warn!(
                target = "voice::session",
                session = %self.id,
                error = %err,
                "ICE restart failed, closing"
            );
            self.fail_terminally().await;
        }
    }

    async fn fail_terminally(&mut self) {
        self.state = SessionState::Failed;
        self.publish(SessionEvent::Failed);
        self.teardown().await;
        self.state = SessionState::Closed;
    }

    /// Enable or disable the outbound microphone track without touching the
    /// negotiated session. No-op without a live peer.
    pub async fn set_microphone_muted(&mut self, muted: bool) -> VoiceResult<()> {
        match &self.peer {
            Some(peer) => peer.set_outbound_enabled(!muted).await,
            None => {
                debug!(
                    target = "voice::session",
                    session = %self.id,
                    "mute toggle with no live peer, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Mute or unmute all inbound playback sinks.
    pub fn set_playback_muted(&mut self, muted: bool) {
        self.tracks.set_playback_muted(muted);
    }

    /// Swap the outbound track without renegotiation, releasing the old
    /// capture stream.
    pub async fn replace_outbound_track(
        &mut self,
        stream: Arc<dyn CaptureStream>,
    ) -> VoiceResult<()> {
        match &self.peer {
            Some(peer) => {
                peer.replace_track(stream.clone()).await?;
                if let Some(old) = self.capture.replace(stream) {
                    old.stop();
                }
                Ok(())
            }
            None => {
                debug!(
                    target = "voice::session",
                    session = %self.id,
                    "track replacement with no live peer, ignoring"
                );
                Ok(())
            }
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.events.publish(VoiceEvent {
            session: self.id.clone(),
            role: self.role,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use voice_signal::LocalSignaling;

    use super::*;
    use crate::mock::{MockPlatform, PeerOp, RecordingSinkFactory};

    fn harness(role: Role) -> (PeerSession, Arc<MockPlatform>, Arc<LocalSignaling>, LocalSignaling)
    {
        let platform = MockPlatform::new();
        let (local, remote) = LocalSignaling::pair();
        let local = Arc::new(local);
        let session = PeerSession::new(
            "session-1".to_string(),
            role,
            VoiceConfig::localhost(),
            platform.clone(),
            local.clone(),
            RecordingSinkFactory::new(),
            Arc::new(EventHub::new()),
        );
        (session, platform, local, remote)
    }

    #[tokio::test]
    async fn publisher_start_publishes_track_then_offers() {
        let (mut session, platform, _signaling, remote) = harness(Role::Publisher);
        session.start().await.expect("start");

        let peer = platform.last_peer().expect("peer created");
        let ops = peer.ops();
        assert!(matches!(ops[0], PeerOp::PublishTrack(_)));
        assert_eq!(ops[1], PeerOp::CreateOffer { ice_restart: false });
        assert_eq!(ops[2], PeerOp::SetLocal(SdpKind::Offer));

        let (_, first) = remote.try_recv().expect("start_streaming");
        assert_eq!(first, SignalMessage::StartStreaming);
        let (_, second) = remote.try_recv().expect("offer");
        assert_eq!(second.kind(), "offer");
        assert_eq!(session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn capture_denial_leaves_no_partial_state() {
        let (mut session, platform, _signaling, remote) = harness(Role::Publisher);
        platform.deny_microphone(true);
        match session.start().await {
            Err(VoiceError::CaptureDeviceDenied(_)) => {}
            other => panic!("expected capture denial, got {other:?}"),
        }
        assert_eq!(platform.peer_count(), 0);
        assert!(remote.try_recv().is_none());
        assert_eq!(session.state(), SessionState::New);
    }

    #[tokio::test]
    async fn start_failure_after_acquisition_releases_resources() {
        let (mut session, platform, _signaling, remote) = harness(Role::Publisher);
        // Dead signaling link: the start notification cannot be delivered.
        drop(remote);
        assert!(session.start().await.is_err());
        assert!(platform.captures()[0].is_stopped());
        assert!(platform.last_peer().expect("peer").is_closed());
        assert_eq!(session.state(), SessionState::New);
    }

    #[tokio::test]
    async fn stale_answer_is_dropped_not_fatal() {
        let (mut session, platform, _signaling, _remote) = harness(Role::Publisher);
        session.start().await.expect("start");
        let peer = platform.last_peer().expect("peer");

        session
            .handle_signal(SignalMessage::Answer {
                sdp: "v=0 remote".into(),
            })
            .await
            .expect("first answer ok");
        // A retried answer has no outstanding offer to match.
        session
            .handle_signal(SignalMessage::Answer {
                sdp: "v=0 retry".into(),
            })
            .await
            .expect("stale answer is a no-op");
        let remote_sets = peer
            .ops()
            .iter()
            .filter(|op| matches!(op, PeerOp::SetRemote(SdpKind::Answer)))
            .count();
        assert_eq!(remote_sets, 1);
    }

    #[tokio::test]
    async fn subscriber_provisions_lines_before_offering() {
        let (mut session, platform, signaling, remote) = harness(Role::Subscriber);
        signaling.set_transceiver_count(&"session-1".to_string(), 3);
        session.start().await.expect("start");

        let peer = platform.last_peer().expect("peer");
        assert_eq!(peer.recv_transceivers(), 3);
        assert_eq!(session.provisioned_transceivers(), 3);
        let ops = peer.ops();
        let offer_at = ops
            .iter()
            .position(|op| matches!(op, PeerOp::CreateOffer { .. }))
            .expect("offer created");
        let last_line_at = ops
            .iter()
            .rposition(|op| matches!(op, PeerOp::AddRecvTransceiver))
            .expect("lines added");
        assert!(last_line_at < offer_at, "lines precede the offer");
        let (_, message) = remote.try_recv().expect("offer emitted");
        assert_eq!(message.kind(), "offer");
    }

    #[tokio::test]
    async fn equal_transceiver_count_does_not_renegotiate() {
        let (mut session, platform, signaling, remote) = harness(Role::Subscriber);
        signaling.set_transceiver_count(&"session-1".to_string(), 2);
        session.start().await.expect("start");
        let peer = platform.last_peer().expect("peer");
        assert_eq!(peer.offers_created(), 1);
        while remote.try_recv().is_some() {}

        // Answer the round so a later offer would be permitted, then report
        // an unchanged count.
        session
            .handle_signal(SignalMessage::Answer {
                sdp: "v=0 remote".into(),
            })
            .await
            .expect("answer");
        while remote.try_recv().is_some() {}
        session
            .handle_signal(SignalMessage::TransceiverCount { count: 2 })
            .await
            .expect("count");
        assert_eq!(peer.offers_created(), 1);
        assert!(remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn shrunk_transceiver_count_is_a_reported_defect() {
        let (mut session, _platform, signaling, _remote) = harness(Role::Subscriber);
        signaling.set_transceiver_count(&"session-1".to_string(), 3);
        session.start().await.expect("start");
        match session
            .handle_signal(SignalMessage::TransceiverCount { count: 1 })
            .await
        {
            Err(VoiceError::AllocatorInvariant {
                desired,
                provisioned,
            }) => {
                assert_eq!(desired, 1);
                assert_eq!(provisioned, 3);
            }
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_on_never_started() {
        let (mut session, platform, _signaling, remote) = harness(Role::Publisher);
        // Never started: a pure no-op.
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(remote.try_recv().is_none());
        assert_eq!(platform.peer_count(), 0);
        // And again.
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn stop_releases_capture_and_notifies() {
        let (mut session, platform, _signaling, remote) = harness(Role::Publisher);
        session.start().await.expect("start");
        while remote.try_recv().is_some() {}

        session.stop().await;
        let peer = platform.last_peer().expect("peer");
        assert!(peer.is_closed());
        assert!(platform.captures()[0].is_stopped());
        let (_, message) = remote.try_recv().expect("stop notification");
        assert_eq!(message, SignalMessage::StopStreaming);

        session.stop().await;
        assert!(remote.try_recv().is_none(), "second stop sends nothing");
    }
}
