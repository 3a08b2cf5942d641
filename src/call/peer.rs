//! Peer-connection construction and callback wiring.
//!
//! Callbacks never own the session: they carry the user id plus weak
//! handles and look state up in the registry when they fire, so anything
//! arriving after cleanup simply finds nothing.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::media::audio::AudioPlayer;
use crate::proto::SignalKind;

use super::session::CallSession;
use super::{CallError, CallManager};

const VP8_PAYLOAD_TYPE: u8 = 96;
const OPUS_PAYLOAD_TYPE: u8 = 111;

const PLI_BURST: u32 = 3;
const PLI_BURST_SPACING: Duration = Duration::from_millis(100);
const PLI_INTERVAL: Duration = Duration::from_secs(1);
const PLI_MAX_ERRORS: u32 = 3;

/// Build a peer connection with VP8 and Opus registered and the product's
/// STUN/TURN set.
pub(super) async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "goog-remb".to_owned(),
                            parameter: String::new(),
                        },
                        RTCPFeedback {
                            typ: "ccm".to_owned(),
                            parameter: "fir".to_owned(),
                        },
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: String::new(),
                        },
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: "pli".to_owned(),
                        },
                    ],
                },
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(CallError::Peer)?;
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: Vec::new(),
                },
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(CallError::Peer)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(CallError::Peer)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![
            RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            },
            RTCIceServer {
                urls: vec!["stun:stun1.l.google.com:19302".to_owned()],
                ..Default::default()
            },
            RTCIceServer {
                urls: vec!["turn:relay.mezon.vn:5349".to_owned()],
                username: "turnmezon".to_owned(),
                credential: "QuTs4zUEcbylWemXL7MK".to_owned(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(CallError::Peer)?;
    Ok(Arc::new(pc))
}

impl CallManager {
    pub(super) fn wire_peer_handlers(self: &Arc<Self>, user_id: i64, pc: &Arc<RTCPeerConnection>) {
        let weak_manager = Arc::downgrade(self);
        let weak_pc = Arc::downgrade(pc);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak_manager = Weak::clone(&weak_manager);
            let weak_pc = Weak::clone(&weak_pc);
            Box::pin(async move {
                let Some(manager) = weak_manager.upgrade() else {
                    return;
                };
                match candidate {
                    Some(candidate) => manager.send_local_candidate(user_id, candidate).await,
                    None => {
                        debug!(user_id, "ice gathering complete");
                        // Let the answer land before the SDP re-emission.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        let Some(pc) = weak_pc.upgrade() else { return };
                        let Some(description) = pc.local_description().await else {
                            return;
                        };
                        let Some(session) = manager.session(user_id) else {
                            return;
                        };
                        let manager = Arc::clone(&manager);
                        let channel_id = session.channel_id;
                        tokio::spawn(async move {
                            manager
                                .send_candidates_from_sdp(user_id, channel_id, &description.sdp)
                                .await;
                        });
                    }
                }
            })
        }));

        let weak_manager = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak_manager = Weak::clone(&weak_manager);
            Box::pin(async move {
                info!(user_id, state = %state, "peer connection state");
                let Some(manager) = weak_manager.upgrade() else {
                    return;
                };
                match state {
                    RTCPeerConnectionState::Connected => {
                        manager.start_welcome_audio(user_id);
                    }
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                        manager.cleanup_session(user_id).await;
                    }
                    _ => {}
                }
            })
        }));

        let weak_manager = Arc::downgrade(self);
        let weak_pc = Arc::downgrade(pc);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak_manager = Weak::clone(&weak_manager);
            let weak_pc = Weak::clone(&weak_pc);
            Box::pin(async move {
                let mime = track.codec().capability.mime_type.clone();
                info!(user_id, kind = %track.kind(), codec = %mime, "track bound");
                if track.kind() != RTPCodecType::Video || !mime.contains("VP8") {
                    return;
                }
                let Some(manager) = weak_manager.upgrade() else {
                    return;
                };
                let Some(session) = manager.session(user_id) else {
                    warn!(user_id, "video track for unknown session");
                    return;
                };
                let ssrc = track.ssrc();

                if let Some(pc) = weak_pc.upgrade() {
                    spawn_pli_emitters(&pc, ssrc, session.cancel.child_token());
                }
                manager.spawn_capture(Arc::clone(&session), track);
            })
        }));
    }

    /// Add the outbound Opus track and attach an audio player to the
    /// session. The sender's RTCP stream is drained so interceptors keep
    /// running.
    pub(super) async fn setup_audio_track(
        &self,
        session: &Arc<CallSession>,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), CallError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "bot-audio-stream".to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(CallError::Peer)?;

        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = sender.read(&mut buf) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        session.set_audio_player(AudioPlayer::new(track, session.audio_stop.clone()));
        debug!(user_id = session.user_id, "audio track ready");
        Ok(())
    }

    async fn send_local_candidate(&self, user_id: i64, candidate: RTCIceCandidate) {
        let Some(session) = self.session(user_id) else {
            return;
        };
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(err) => {
                warn!(user_id, error = %err, "candidate serialization failed");
                return;
            }
        };
        let payload = match serde_json::to_string(&init) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(user_id, error = %err, "candidate encode failed");
                return;
            }
        };
        if let Err(err) = self
            .client
            .send_webrtc_signal(
                user_id,
                self.client.client_id(),
                session.channel_id,
                SignalKind::IceCandidate,
                payload,
            )
            .await
        {
            warn!(user_id, error = %err, "ice candidate not sent");
        }
    }

    /// Re-emit the candidates embedded in the local SDP, paced so peers
    /// that only read SDP-carried candidates are not flooded.
    pub(super) async fn send_candidates_from_sdp(&self, user_id: i64, channel_id: i64, sdp: &str) {
        let candidates = crate::util::sdp::extract_candidates(sdp);
        debug!(user_id, count = candidates.len(), "re-emitting sdp candidates");
        let mut sent = 0usize;
        for candidate in candidates {
            let payload = serde_json::json!({
                "candidate": candidate.candidate,
                "sdpMid": candidate.sdp_mid,
                "sdpMLineIndex": candidate.sdp_mline_index,
            })
            .to_string();
            if self
                .client
                .send_webrtc_signal(
                    user_id,
                    self.client.client_id(),
                    channel_id,
                    SignalKind::IceCandidate,
                    payload,
                )
                .await
                .is_ok()
            {
                sent += 1;
            }
            tokio::time::sleep(self.capture.ice_from_sdp_pacing).await;
        }
        debug!(user_id, sent, "sdp candidates sent");
    }
}

async fn write_pli(pc: &RTCPeerConnection, media_ssrc: u32) -> Result<(), webrtc::Error> {
    let packets: [Box<dyn Packet + Send + Sync>; 1] = [Box::new(PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    })];
    pc.write_rtcp(&packets).await.map(|_| ())
}

/// Force an early IDR with a short PLI burst, then keep nudging the sender
/// every second until the session winds down or writes keep failing.
fn spawn_pli_emitters(pc: &Arc<RTCPeerConnection>, ssrc: u32, cancel: CancellationToken) {
    let burst_pc = Arc::clone(pc);
    tokio::spawn(async move {
        for _ in 0..PLI_BURST {
            if write_pli(&burst_pc, ssrc).await.is_ok() {
                debug!("immediate pli sent");
            }
            tokio::time::sleep(PLI_BURST_SPACING).await;
        }
    });

    let periodic_pc = Arc::clone(pc);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        let mut consecutive_errors = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("pli emitter stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let state = periodic_pc.connection_state();
            if state == RTCPeerConnectionState::Closed || state == RTCPeerConnectionState::Failed {
                return;
            }
            match write_pli(&periodic_pc, ssrc).await {
                Ok(()) => consecutive_errors = 0,
                Err(_) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= PLI_MAX_ERRORS {
                        warn!(errors = consecutive_errors, "pli emitter giving up");
                        return;
                    }
                }
            }
        }
    });
}
