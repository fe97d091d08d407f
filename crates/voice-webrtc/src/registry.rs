//! Owns every live session and routes signaling and platform events to them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use voice_signal::{SessionId, SignalMessage, SignalingTransport};

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventHub;
use crate::platform::{AudioSinkFactory, CaptureStream, MediaPlatform, PeerEventRx};
use crate::session::{PeerSession, Role, SessionState};

/// Registry of live peer sessions, keyed by [`SessionId`].
///
/// Each session sits behind its own async mutex, so its handlers never
/// interleave with themselves while independent sessions proceed in
/// parallel. A per-session pump task drives platform events into the
/// session and retires it from the registry once it closes.
pub struct SessionRegistry {
    config: VoiceConfig,
    platform: Arc<dyn MediaPlatform>,
    signaling: Arc<dyn SignalingTransport>,
    sink_factory: Arc<dyn AudioSinkFactory>,
    events: Arc<EventHub>,
    sessions: RwLock<HashMap<SessionId, Arc<AsyncMutex<PeerSession>>>>,
}

impl SessionRegistry {
    pub fn new(
        config: VoiceConfig,
        platform: Arc<dyn MediaPlatform>,
        signaling: Arc<dyn SignalingTransport>,
        sink_factory: Arc<dyn AudioSinkFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            platform,
            signaling,
            sink_factory,
            events: Arc::new(EventHub::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Hub carrying every session's lifecycle events.
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Create and start a session for `id`. Errors if the id already has a
    /// live session, or if startup fails (in which case nothing is retained).
    pub async fn start_session(self: &Arc<Self>, id: SessionId, role: Role) -> VoiceResult<()> {
        let session = PeerSession::new(
            id.clone(),
            role,
            self.config.clone(),
            self.platform.clone(),
            self.signaling.clone(),
            self.sink_factory.clone(),
            self.events.clone(),
        );
        let slot = Arc::new(AsyncMutex::new(session));
        // Reserve the id before the first await: a second start for the same
        // identity must lose immediately, not race resource acquisition.
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(VoiceError::AlreadyActive(id));
            }
            sessions.insert(id.clone(), slot.clone());
        }
        info!(
            target = "voice::registry",
            session = %id,
            role = role.as_str(),
            "starting session"
        );
        let mut session = slot.lock().await;
        if let Err(err) = session.start().await {
            drop(session);
            self.sessions.write().remove(&id);
            return Err(err);
        }
        let peer_events = session.take_peer_events();
        drop(session);
        if let Some(rx) = peer_events {
            self.spawn_event_pump(id, slot, rx);
        }
        Ok(())
    }

    /// Stop and remove the session for `id`. Unknown ids are a no-op.
    pub async fn stop_session(&self, id: &SessionId) {
        let Some(slot) = self.sessions.write().remove(id) else {
            debug!(target = "voice::registry", session = %id, "stop for unknown session");
            return;
        };
        slot.lock().await.stop().await;
    }

    /// Route one inbound signaling message. Messages for unknown sessions
    /// are dropped with a warning; late signals after teardown are expected.
    pub async fn handle_signal(&self, id: &SessionId, message: SignalMessage) -> VoiceResult<()> {
        let Some(slot) = self.sessions.read().get(id).cloned() else {
            warn!(
                target = "voice::registry",
                session = %id,
                kind = message.kind(),
                "signal for unknown session dropped"
            );
            return Ok(());
        };
        let mut session = slot.lock().await;
        session.handle_signal(message).await
    }

    /// Toggle the outbound microphone track of a publisher session.
    pub async fn set_microphone_muted(&self, id: &SessionId, muted: bool) -> VoiceResult<()> {
        let Some(slot) = self.sessions.read().get(id).cloned() else {
            return Ok(());
        };
        let mut session = slot.lock().await;
        session.set_microphone_muted(muted).await
    }

    /// Swap a publisher session's outbound track without renegotiation.
    pub async fn replace_outbound_track(
        &self,
        id: &SessionId,
        stream: Arc<dyn CaptureStream>,
    ) -> VoiceResult<()> {
        let Some(slot) = self.sessions.read().get(id).cloned() else {
            return Ok(());
        };
        let mut session = slot.lock().await;
        session.replace_outbound_track(stream).await
    }

    /// Mute or unmute playback for every inbound track of a session.
    pub async fn set_playback_muted(&self, id: &SessionId, muted: bool) {
        let Some(slot) = self.sessions.read().get(id).cloned() else {
            return;
        };
        slot.lock().await.set_playback_muted(muted);
    }

    /// Stop every session. Used on shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (id, slot) in drained {
            debug!(target = "voice::registry", session = %id, "stopping on shutdown");
            slot.lock().await.stop().await;
        }
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        id: SessionId,
        slot: Arc<AsyncMutex<PeerSession>>,
        mut rx: PeerEventRx,
    ) {
        // Weak so a pump never keeps a dropped registry alive.
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut session = slot.lock().await;
                session.on_peer_event(event).await;
                let closed = session.state() == SessionState::Closed;
                drop(session);
                if closed {
                    if let Some(registry) = registry.upgrade() {
                        registry.sessions.write().remove(&id);
                        debug!(
                            target = "voice::registry",
                            session = %id,
                            "closed session retired"
                        );
                    }
                    break;
                }
            }
        });
    }
}
