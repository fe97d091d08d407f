//! Production media platform on top of the `webrtc` crate.
//!
//! Capture hardware stays outside this crate: an embedding process supplies
//! a [`CaptureDevice`] producing encoded Opus samples, and this layer turns
//! it into a local track, feeds it, and surfaces peer connection activity as
//! [`PeerEvent`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use voice_signal::IceCandidate;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::platform::{
    CaptureStream, ConnectionState, MediaPlatform, PeerEvent, PeerEventRx, PeerHandle, SdpKind,
};

/// Source of encoded Opus samples from the capture hardware. Opening it is
/// where the OS permission prompt happens; denial surfaces as
/// [`VoiceError::CaptureDeviceDenied`].
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self) -> VoiceResult<mpsc::Receiver<Sample>>;
}

type TrackMap = Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>;

/// [`MediaPlatform`] backed by the `webrtc` crate and a [`CaptureDevice`].
pub struct RtcPlatform {
    api: API,
    device: Arc<dyn CaptureDevice>,
    // Capture id to its local track, so peers can publish a stream they are
    // handed only as an opaque CaptureStream.
    tracks: Arc<TrackMap>,
}

impl RtcPlatform {
    pub fn new(device: Arc<dyn CaptureDevice>) -> VoiceResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(platform_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(platform_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            device,
            tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl MediaPlatform for RtcPlatform {
    async fn acquire_microphone(&self) -> VoiceResult<Arc<dyn CaptureStream>> {
        let mut samples = self.device.open().await?;
        let id = Uuid::new_v4().to_string();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{id}"),
            format!("capture-{id}"),
        ));
        self.tracks.lock().insert(id.clone(), track.clone());

        let feeder_track = track.clone();
        let feeder_id = id.clone();
        let feeder = tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                if let Err(err) = feeder_track.write_sample(&sample).await {
                    debug!(
                        target = "voice::rtc",
                        capture = %feeder_id,
                        error = %err,
                        "sample write failed, stopping feed"
                    );
                    break;
                }
            }
            trace!(target = "voice::rtc", capture = %feeder_id, "capture feed ended");
        });

        Ok(Arc::new(RtcCapture {
            id,
            tracks: Arc::downgrade(&self.tracks),
            feeder: Mutex::new(Some(feeder)),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn create_peer(
        &self,
        config: &VoiceConfig,
    ) -> VoiceResult<(Arc<dyn PeerHandle>, PeerEventRx)> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| webrtc::ice_transport::ice_server::RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(platform_err)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        wire_callbacks(&pc, events_tx);
        let peer = Arc::new(RtcPeer {
            pc,
            tracks: self.tracks.clone(),
            sender: Mutex::new(None),
            outbound: Mutex::new(None),
        });
        Ok((peer, events_rx))
    }
}

struct RtcCapture {
    id: String,
    tracks: std::sync::Weak<TrackMap>,
    feeder: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl CaptureStream for RtcCapture {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(feeder) = self.feeder.lock().take() {
            feeder.abort();
        }
        if let Some(tracks) = self.tracks.upgrade() {
            tracks.lock().remove(&self.id);
        }
        debug!(target = "voice::rtc", capture = %self.id, "capture stream released");
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        };
        let _ = state_tx.send(PeerEvent::ConnectionState(mapped));
        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(Some(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index.map(u32::from),
                        })));
                    }
                    Err(err) => {
                        warn!(target = "voice::rtc", error = %err, "candidate not serializable");
                    }
                },
                None => {
                    // End of gathering, forwarded as the null sentinel.
                    let _ = tx.send(PeerEvent::LocalCandidate(None));
                }
            }
        })
    }));

    let track_tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = track_tx.clone();
        Box::pin(async move {
            let track_id = track.id();
            let stream_id = track.stream_id();
            debug!(
                target = "voice::rtc",
                track = %track_id,
                stream = %stream_id,
                "remote track started"
            );
            let _ = tx.send(PeerEvent::TrackAdded {
                track_id: track_id.clone(),
                stream_id,
            });
            // Drain RTP until the track ends; an error is the end signal.
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                trace!(target = "voice::rtc", track = %track_id, "remote track ended");
                let _ = tx.send(PeerEvent::TrackEnded { track_id });
            });
        })
    }));
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: Arc<TrackMap>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
    outbound: Mutex<Option<Arc<TrackLocalStaticSample>>>,
}

impl RtcPeer {
    fn track_for(&self, stream: &Arc<dyn CaptureStream>) -> VoiceResult<Arc<TrackLocalStaticSample>> {
        self.tracks
            .lock()
            .get(stream.id())
            .cloned()
            .ok_or_else(|| VoiceError::Platform(format!("unknown capture stream {}", stream.id())))
    }
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> VoiceResult<String> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self.pc.create_offer(options).await.map_err(negotiation_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> VoiceResult<String> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> VoiceResult<()> {
        let desc = description(kind, sdp)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> VoiceResult<()> {
        let desc = description(kind, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> VoiceResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|idx| idx as u16),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(platform_err)
    }

    async fn add_recv_transceiver(&self) -> VoiceResult<()> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(platform_err)?;
        Ok(())
    }

    async fn publish_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()> {
        let track = self.track_for(&stream)?;
        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(platform_err)?;
        // The sender reports RTCP we have no use for, but it must be read
        // for interceptors to run.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        *self.sender.lock() = Some(sender);
        *self.outbound.lock() = Some(track);
        Ok(())
    }

    async fn replace_track(&self, stream: Arc<dyn CaptureStream>) -> VoiceResult<()> {
        let track = self.track_for(&stream)?;
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| VoiceError::Platform("no published track to replace".into()))?;
        sender
            .replace_track(Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(platform_err)?;
        *self.outbound.lock() = Some(track);
        Ok(())
    }

    async fn set_outbound_enabled(&self, enabled: bool) -> VoiceResult<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| VoiceError::Platform("no published track to toggle".into()))?;
        // Mute by detaching the track from the sender; the m-line stays, so
        // no renegotiation happens.
        let replacement = if enabled {
            let track = self
                .outbound
                .lock()
                .clone()
                .ok_or_else(|| VoiceError::Platform("no outbound track retained".into()))?;
            Some(track as Arc<dyn TrackLocal + Send + Sync>)
        } else {
            None
        };
        sender.replace_track(replacement).await.map_err(platform_err)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(target = "voice::rtc", error = %err, "peer connection close failed");
        }
    }
}

fn description(kind: SdpKind, sdp: String) -> VoiceResult<RTCSessionDescription> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    desc.map_err(negotiation_err)
}

fn negotiation_err(err: webrtc::Error) -> VoiceError {
    VoiceError::NegotiationFailed(err.to_string())
}

fn platform_err(err: webrtc::Error) -> VoiceError {
    VoiceError::Platform(err.to_string())
}
