//! Call orchestration.
//!
//! [`CallManager`] owns the session registry and drives the per-user state
//! machine: forwarded signaling envelopes create and feed sessions, the
//! capture loop reports recognition results, location confirmation closes
//! the loop, and cleanup tears everything down exactly once per session.

mod capture;
pub mod location;
mod peer;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::api::{ApiError, RecognitionClient};
use crate::client::dm::{
    build_checkin_confirmation, build_checkin_failed, build_checkin_success, DmCoordinator,
};
use crate::client::{Event, GatewayClient, GatewayError};
use crate::config::{AudioConfig, CaptureConfig, DimensionConfig, FaceConfig};
use crate::detect::FaceDetector;
use crate::media::audio::{AudioLibrary, PromptItem};
use crate::media::MediaError;
use crate::proto::{ChannelMessageEvent, SignalKind, WebrtcSignalingFwd, MESSAGE_CODE_LOCATION};
use crate::util::gzip;
use crate::util::sdp;

use location::{ConfirmationRegistry, LocationError, OfficeDirectory, CONFIRMATION_TIMEOUT};
use session::CallSession;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long cleanup waits for subordinate tasks to observe the cancel
/// before closing their resources underneath them.
const CANCEL_SETTLE: Duration = Duration::from_millis(100);

const PROMPT_WELCOME: &str = "welcome";
const PROMPT_SUCCESS: &str = "checkin_success";
const PROMPT_FAIL: &str = "checkin_fail";
const PROMPT_BACKGROUND: &str = "background_music";

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("peer connection error: {0}")]
    Peer(#[source] webrtc::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("location error: {0}")]
    Location(#[from] LocationError),
    #[error("location outside every office radius")]
    InvalidLocation,
    #[error("no pending confirmation for user {0}")]
    NoPendingConfirmation(i64),
    #[error("no session for user {0}")]
    SessionNotFound(i64),
}

/// Static wiring for the call manager.
pub struct CallManagerConfig {
    pub face: FaceConfig,
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub dims: DimensionConfig,
    pub offices_path: String,
    pub captures_dir: String,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            face: FaceConfig::default(),
            audio: AudioConfig::default(),
            capture: CaptureConfig::default(),
            dims: DimensionConfig::default(),
            offices_path: "config/offices.json".into(),
            captures_dir: "./image-captures".into(),
        }
    }
}

pub struct CallManager {
    client: Arc<GatewayClient>,
    dm: Arc<DmCoordinator>,
    recognition: RecognitionClient,
    detector: Option<Arc<dyn FaceDetector>>,
    face: FaceConfig,
    audio: AudioConfig,
    audio_library: AudioLibrary,
    capture: CaptureConfig,
    dims: DimensionConfig,
    offices: OfficeDirectory,
    sessions: RwLock<HashMap<i64, Arc<CallSession>>>,
    confirmations: ConfirmationRegistry,
    shutdown: CancellationToken,
    shutdown_latch: AtomicBool,
    captures_dir: PathBuf,
}

impl CallManager {
    pub fn new(
        client: Arc<GatewayClient>,
        recognition: RecognitionClient,
        detector: Option<Arc<dyn FaceDetector>>,
        config: CallManagerConfig,
    ) -> Result<Arc<Self>, CallError> {
        let offices = OfficeDirectory::load(&config.offices_path)?;

        let audio_library = AudioLibrary::new();
        if config.audio.enabled {
            let mut files = vec![
                (PROMPT_WELCOME, config.audio.welcome_path.clone()),
                (PROMPT_SUCCESS, config.audio.checkin_success_path.clone()),
                (PROMPT_FAIL, config.audio.checkin_fail_path.clone()),
            ];
            if let Some(path) = &config.audio.background_music_path {
                files.push((PROMPT_BACKGROUND, path.clone()));
            }
            for (name, path) in files {
                if let Err(err) = audio_library.register(name, &path) {
                    warn!(name, error = %err, "audio prompt not registered");
                }
            }
            info!(count = audio_library.names().len(), "audio prompts registered");
        }

        if config.face.enabled && detector.is_none() {
            warn!("face recognition enabled but no detector available, captures will not match");
        }

        let captures_dir = PathBuf::from(&config.captures_dir);
        if let Err(err) = std::fs::create_dir_all(&captures_dir) {
            warn!(error = %err, "could not create capture output directory");
        }

        let manager = Arc::new(Self {
            dm: DmCoordinator::new(Arc::clone(&client)),
            client,
            recognition,
            detector,
            face: config.face,
            audio: config.audio,
            audio_library,
            capture: config.capture,
            dims: config.dims,
            offices,
            sessions: RwLock::new(HashMap::new()),
            confirmations: ConfirmationRegistry::new(),
            shutdown: CancellationToken::new(),
            shutdown_latch: AtomicBool::new(false),
            captures_dir,
        });
        manager.register_handlers();
        Ok(manager)
    }

    pub fn session(&self, user_id: i64) -> Option<Arc<CallSession>> {
        self.sessions.read().get(&user_id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.client.on(Event::WEBRTC_SIGNALING, move |event| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let (Some(manager), Event::WebrtcSignal(signal)) = (weak.upgrade(), event) else {
                    return;
                };
                manager.handle_forwarded_signal(signal).await;
            })
        });

        let weak = Arc::downgrade(self);
        self.client.on(Event::CHANNEL_MESSAGE, move |event| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let (Some(manager), Event::ChannelMessage(message)) = (weak.upgrade(), event)
                else {
                    return;
                };
                manager.handle_channel_message(message).await;
            })
        });

        // The peer connections rode on the previous gateway session; after a
        // reconnect they cannot be signaled any further, so tear them down
        // and let callers dial again.
        let weak = Arc::downgrade(self);
        self.client.on(Event::RECONNECTED, move |_| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let Some(manager) = weak.upgrade() else { return };
                manager.teardown_all_sessions().await;
            })
        });
    }

    // ---- signaling ----

    async fn handle_forwarded_signal(self: &Arc<Self>, signal: WebrtcSignalingFwd) {
        let bot_id = self.client.client_id();
        let user_id = if signal.receiver_id == bot_id {
            signal.caller_id
        } else if signal.caller_id == bot_id {
            // Echo of a signal the bot sent.
            signal.receiver_id
        } else {
            warn!(
                caller = signal.caller_id,
                receiver = signal.receiver_id,
                "signal does not involve this bot"
            );
            return;
        };
        if user_id == 0 {
            warn!("could not determine signal user");
            return;
        }
        if let Err(err) = self.handle_signal(user_id, signal).await {
            warn!(user_id, error = %err, "signal handling failed");
        }
    }

    pub async fn handle_signal(
        self: &Arc<Self>,
        user_id: i64,
        signal: WebrtcSignalingFwd,
    ) -> Result<(), CallError> {
        debug!(
            user_id,
            data_type = signal.data_type,
            channel_id = signal.channel_id,
            "webrtc signal"
        );
        match SignalKind::from_wire(signal.data_type) {
            Some(SignalKind::Offer) => self.handle_offer(user_id, signal).await,
            Some(SignalKind::IceCandidate) => self.handle_remote_candidate(user_id, &signal).await,
            Some(SignalKind::Quit) => {
                info!(user_id, "call ended by user");
                self.cleanup_session(user_id).await;
                Ok(())
            }
            Some(SignalKind::StatusRemoteMedia) => Ok(()),
            other => {
                debug!(user_id, kind = ?other, "ignoring signal");
                Ok(())
            }
        }
    }

    async fn handle_offer(
        self: &Arc<Self>,
        user_id: i64,
        signal: WebrtcSignalingFwd,
    ) -> Result<(), CallError> {
        info!(user_id, channel_id = signal.channel_id, "processing offer");

        let mut offer_data = signal.json_data;
        if offer_data.starts_with(gzip::GZIP_BASE64_PREFIX) {
            offer_data = gzip::decompress(&offer_data)
                .map_err(|err| CallError::Signaling(format!("offer decompress: {err}")))?;
        }
        let sdp_text = match serde_json::from_str::<serde_json::Value>(&offer_data) {
            Ok(value) => value
                .get("sdp")
                .and_then(|sdp| sdp.as_str())
                .map(str::to_string)
                .ok_or_else(|| CallError::Signaling("offer missing sdp".into()))?,
            // Some callers send the bare SDP without the JSON wrapper.
            Err(_) => offer_data,
        };

        let pc = peer::create_peer_connection().await?;
        let session = CallSession::new(user_id, signal.channel_id, Some(Arc::clone(&pc)));

        let previous = self.sessions.write().insert(user_id, Arc::clone(&session));
        if let Some(previous) = previous {
            warn!(user_id, "replacing live session on new offer");
            self.cleanup_entry(previous).await;
        }

        self.wire_peer_handlers(user_id, &pc);

        let offer = RTCSessionDescription::offer(sdp_text).map_err(CallError::Peer)?;
        if let Err(err) = pc.set_remote_description(offer).await {
            self.cleanup_session(user_id).await;
            return Err(CallError::Peer(err));
        }

        if self.audio.enabled {
            if let Err(err) = self.setup_audio_track(&session, &pc).await {
                warn!(user_id, error = %err, "audio track setup failed");
            }
        }

        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                self.cleanup_session(user_id).await;
                return Err(CallError::Peer(err));
            }
        };
        if let Err(err) = pc.set_local_description(answer.clone()).await {
            self.cleanup_session(user_id).await;
            return Err(CallError::Peer(err));
        }

        let patched = sdp::patch_for_quality(&answer.sdp, 2500, 1500, 3000);
        let answer_json =
            serde_json::json!({ "type": "answer", "sdp": patched }).to_string();
        let compressed = gzip::compress(&answer_json);

        // Give ICE gathering a head start before the answer goes out.
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Err(err) = self
            .client
            .send_webrtc_signal(
                user_id,
                self.client.client_id(),
                signal.channel_id,
                SignalKind::Answer,
                compressed,
            )
            .await
        {
            self.cleanup_session(user_id).await;
            return Err(err.into());
        }

        session.release_pending_ice().await;
        info!(user_id, "answer sent");
        Ok(())
    }

    async fn handle_remote_candidate(
        &self,
        user_id: i64,
        signal: &WebrtcSignalingFwd,
    ) -> Result<(), CallError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(&signal.json_data)
            .map_err(|err| CallError::Signaling(format!("invalid candidate: {err}")))?;
        let session = self
            .session(user_id)
            .ok_or(CallError::SessionNotFound(user_id))?;
        session.add_remote_candidate(candidate).await
    }

    // ---- lifecycle ----

    /// Remove the session and tear it down. Safe to call any number of
    /// times from any task.
    pub async fn cleanup_session(&self, user_id: i64) {
        let Some(session) = self.sessions.write().remove(&user_id) else {
            return;
        };
        self.cleanup_entry(session).await;
    }

    async fn cleanup_entry(&self, session: Arc<CallSession>) {
        if !session.begin_cleanup() {
            return;
        }
        let user_id = session.user_id;
        info!(user_id, "cleaning up session");

        session.cancel.cancel();
        tokio::time::sleep(CANCEL_SETTLE).await;
        session.audio_stop.cancel();
        session.close_peer().await;

        if let Err(err) = self
            .client
            .send_webrtc_signal(
                user_id,
                self.client.client_id(),
                session.channel_id,
                SignalKind::Quit,
                String::new(),
            )
            .await
        {
            debug!(user_id, error = %err, "quit signal not delivered");
        }
        info!(user_id, "session cleanup complete");
    }

    /// End the call after `delay`, once. Used to let a final prompt or DM
    /// flush before hanging up.
    pub fn schedule_end_call(self: &Arc<Self>, user_id: i64, reason: &'static str, delay: Duration) {
        debug!(user_id, reason, delay = ?delay, "scheduling call end");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = manager.session(user_id) else {
                return;
            };
            if session.begin_end_call() {
                info!(user_id, reason, "ending call");
                manager.cleanup_session(user_id).await;
            }
        });
    }

    async fn teardown_all_sessions(&self) {
        let sessions: Vec<Arc<CallSession>> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "tearing down sessions");
        join_all(
            sessions
                .into_iter()
                .map(|session| self.cleanup_entry(session)),
        )
        .await;
    }

    /// Global shutdown: cancel confirmations, tear down every session in
    /// parallel with a deadline, then release shared resources. Idempotent.
    pub async fn shutdown_all(&self) {
        if self.shutdown_latch.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown starting");
        self.shutdown.cancel();
        self.confirmations.cancel_all();

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.teardown_all_sessions())
            .await
            .is_err()
        {
            warn!("session teardown timed out");
        }
        info!("shutdown complete");
    }

    // ---- prompts ----

    fn start_welcome_audio(&self, user_id: i64) {
        if !self.audio.enabled {
            return;
        }
        let Some(player) = self.session(user_id).and_then(|s| s.audio_player()) else {
            warn!(user_id, "no audio player for welcome prompt");
            return;
        };
        let Some(welcome) = self.audio_library.get(PROMPT_WELCOME) else {
            warn!("welcome audio not configured");
            return;
        };

        let background = self
            .audio
            .background_music_enabled
            .then(|| self.audio_library.get(PROMPT_BACKGROUND))
            .flatten();
        let chained_player = Arc::clone(&player);

        player.play(PromptItem {
            path: welcome,
            name: PROMPT_WELCOME.into(),
            looped: false,
            on_finish: background.map(|path| {
                Box::new(move || {
                    chained_player.play(PromptItem {
                        path,
                        name: PROMPT_BACKGROUND.into(),
                        looped: true,
                        on_finish: None,
                    });
                }) as Box<dyn FnOnce() + Send>
            }),
        });
    }

    fn queue_success_audio(&self, user_id: i64) {
        if !self.audio.enabled {
            return;
        }
        let Some(player) = self.session(user_id).and_then(|s| s.audio_player()) else {
            return;
        };
        if let Some(path) = self.audio_library.get(PROMPT_SUCCESS) {
            player.play_now(PromptItem::once(path, PROMPT_SUCCESS));
        }
    }

    fn play_checkin_fail_audio(self: &Arc<Self>, user_id: i64) {
        if !self.audio.enabled {
            self.schedule_end_call(user_id, "fail_no_audio", Duration::from_millis(500));
            return;
        }
        let Some(player) = self.session(user_id).and_then(|s| s.audio_player()) else {
            self.schedule_end_call(user_id, "fail_no_player", Duration::from_millis(500));
            return;
        };
        let Some(path) = self.audio_library.get(PROMPT_FAIL) else {
            self.schedule_end_call(user_id, "fail_no_file", Duration::from_millis(500));
            return;
        };

        let manager = Arc::clone(self);
        player.play_now(PromptItem {
            path,
            name: PROMPT_FAIL.into(),
            looped: false,
            on_finish: Some(Box::new(move || {
                manager.schedule_end_call(user_id, "fail_audio_done", Duration::from_secs(1));
            })),
        });
    }

    // ---- direct messages ----

    pub async fn send_checkin_confirmation(
        self: &Arc<Self>,
        channel_id: i64,
        user_id: i64,
        detected_name: &str,
    ) -> Result<(), GatewayError> {
        info!(user_id, "sending check-in confirmation");
        self.dm
            .send_dm(channel_id, user_id, &build_checkin_confirmation(detected_name))
            .await?;

        let weak = Arc::downgrade(self);
        self.confirmations
            .arm(user_id, channel_id, CONFIRMATION_TIMEOUT, move || {
                let Some(manager) = weak.upgrade() else { return };
                tokio::spawn(async move {
                    manager.confirmation_timed_out(user_id).await;
                });
            });
        Ok(())
    }

    pub async fn send_checkin_success(
        &self,
        channel_id: i64,
        user_id: i64,
        user_name: &str,
    ) -> Result<(), GatewayError> {
        info!(user_id, "sending check-in success");
        self.dm
            .send_dm(channel_id, user_id, &build_checkin_success(user_name))
            .await
    }

    pub async fn send_checkin_failed(
        &self,
        channel_id: i64,
        user_id: i64,
        reason: &str,
    ) -> Result<(), GatewayError> {
        info!(user_id, reason, "sending check-in failure");
        self.dm
            .send_dm(channel_id, user_id, &build_checkin_failed(reason))
            .await
    }

    // ---- location confirmation ----

    async fn handle_channel_message(self: &Arc<Self>, message: ChannelMessageEvent) {
        if message.code != MESSAGE_CODE_LOCATION {
            return;
        }
        let Some((lat, lon)) = location::extract_location(&message.content) else {
            return;
        };
        if message.sender_id == 0 || message.channel_id == 0 {
            warn!("location message without sender or channel");
            return;
        }
        info!(
            user_id = message.sender_id,
            lat,
            lon,
            "location received"
        );
        if let Err(err) = self
            .handle_location_reply(message.sender_id, message.channel_id, lat, lon)
            .await
        {
            warn!(user_id = message.sender_id, error = %err, "location reply failed");
        }
    }

    pub async fn handle_location_reply(
        self: &Arc<Self>,
        user_id: i64,
        channel_id: i64,
        lat: f64,
        lon: f64,
    ) -> Result<(), CallError> {
        if self.confirmations.take_for_reply(user_id).is_none() {
            debug!(user_id, "no pending confirmation for reply");
            return Err(CallError::NoPendingConfirmation(user_id));
        }
        info!(user_id, lat, lon, "location confirmed by user");

        if !self.offices.validate(lat, lon) {
            if let Err(err) = self
                .send_checkin_failed(channel_id, user_id, "Vị trí không hợp lệ")
                .await
            {
                warn!(user_id, error = %err, "failure dm not sent");
            }
            if self.session(user_id).is_some() {
                self.play_checkin_fail_audio(user_id);
                self.schedule_end_call(user_id, "invalid_location", Duration::from_secs(2));
            }
            return Err(CallError::InvalidLocation);
        }

        if let Err(err) = self.recognition.update_status(user_id, "APPROVED").await {
            warn!(user_id, error = %err, "status update failed");
            if let Err(dm_err) = self
                .send_checkin_failed(channel_id, user_id, "Vị trí không hợp lệ")
                .await
            {
                warn!(user_id, error = %dm_err, "failure dm not sent");
            }
            return Err(err.into());
        }

        self.send_checkin_success(channel_id, user_id, "").await?;
        Ok(())
    }

    async fn confirmation_timed_out(self: Arc<Self>, user_id: i64) {
        let Some(state) = self.confirmations.take_for_timeout(user_id) else {
            debug!(user_id, "confirmation already settled");
            return;
        };
        warn!(user_id, "location confirmation timed out");

        if let Err(err) = self
            .send_checkin_failed(state.channel_id, user_id, "Hết thời gian xác nhận vị trí")
            .await
        {
            warn!(user_id, error = %err, "timeout dm not sent");
        }
        if self.session(user_id).is_some() {
            self.play_checkin_fail_audio(user_id);
            self.schedule_end_call(user_id, "confirmation_timeout", Duration::from_secs(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::{GatewayConfig, RetryPolicy};

    fn test_manager() -> (Arc<CallManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let client = GatewayClient::new(
            GatewayConfig {
                bot_id: 9,
                bot_token: "t".into(),
                host: "localhost".into(),
                port: 80,
                use_ssl: false,
                socket_host: "localhost".into(),
                socket_port: 80,
                socket_use_ssl: false,
            },
            RetryPolicy::default(),
        )
        .unwrap();
        let api = ApiClient::new(Duration::from_secs(1), "secret".into()).unwrap();
        let recognition = RecognitionClient::new(api, "http://127.0.0.1:1").unwrap();
        let config = CallManagerConfig {
            audio: AudioConfig {
                enabled: false,
                ..AudioConfig::default()
            },
            offices_path: dir
                .path()
                .join("offices.json")
                .to_str()
                .unwrap()
                .to_string(),
            captures_dir: dir.path().join("captures").to_str().unwrap().to_string(),
            ..CallManagerConfig::default()
        };
        let manager = CallManager::new(client, recognition, None, config).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn manager_loads_default_offices() {
        let (manager, _dir) = test_manager();
        assert!(!manager.offices.offices().is_empty());
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_session_exactly_once() {
        let (manager, _dir) = test_manager();
        let session = CallSession::new(11, 22, None);
        manager
            .sessions
            .write()
            .insert(11, Arc::clone(&session));

        manager.cleanup_session(11).await;
        assert_eq!(manager.active_sessions(), 0);
        // The latch is spent: a second pass has nothing left to claim.
        assert!(!session.begin_cleanup());
        manager.cleanup_session(11).await;
    }

    #[tokio::test]
    async fn concurrent_cleanups_agree_on_a_single_winner() {
        let (manager, _dir) = test_manager();
        let session = CallSession::new(11, 22, None);
        manager
            .sessions
            .write()
            .insert(11, Arc::clone(&session));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                manager.cleanup_session(11).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.active_sessions(), 0);
        assert!(!session.begin_cleanup());
    }

    #[tokio::test]
    async fn location_reply_without_pending_confirmation_is_rejected() {
        let (manager, _dir) = test_manager();
        let result = manager
            .handle_location_reply(5, 6, 20.9725054, 105.7575887)
            .await;
        assert!(matches!(result, Err(CallError::NoPendingConfirmation(5))));
    }

    #[tokio::test]
    async fn unknown_ice_session_is_reported() {
        let (manager, _dir) = test_manager();
        let signal = WebrtcSignalingFwd {
            receiver_id: 9,
            caller_id: 5,
            channel_id: 1,
            data_type: SignalKind::IceCandidate.to_wire(),
            json_data: r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ host"}"#.into(),
        };
        let result = manager.handle_signal(5, signal).await;
        assert!(matches!(result, Err(CallError::SessionNotFound(5))));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (manager, _dir) = test_manager();
        manager
            .sessions
            .write()
            .insert(1, CallSession::new(1, 2, None));
        manager.shutdown_all().await;
        assert_eq!(manager.active_sessions(), 0);
        manager.shutdown_all().await;
    }
}
