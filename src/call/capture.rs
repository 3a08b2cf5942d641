//! The frame-capture loop.
//!
//! Once a VP8 track is bound, an RTP reader feeds a sample builder and the
//! loop races three deadlines: the overall capture window, the
//! first-keyframe window, and the per-attempt throttle. Keyframes that pass
//! the throttle are decoded, searched for a face, cropped, and submitted to
//! the recognition service until it verifies the caller or the attempt cap
//! runs out.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::api::RecognitionResponse;
use crate::detect::{expand_and_center, largest_valid_face};
use crate::media::frame::{crop_square_jpeg_base64, BgrFrame, Rect};
use crate::media::{decode, vp8};

use super::session::CallSession;
use super::CallManager;

const SAMPLE_CHANNEL_DEPTH: usize = 10;
const STREAM_ACTIVE_MARK: u64 = 100;
const CONFIRMATION_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const AUDIO_FLUSH: std::time::Duration = std::time::Duration::from_millis(500);

struct CaptureState {
    last_capture: Instant,
    total_attempts: u32,
    success_count: u32,
    sample_count: u64,
    first_keyframe: bool,
}

impl CallManager {
    pub(super) fn spawn_capture(self: &Arc<Self>, session: Arc<CallSession>, track: Arc<TrackRemote>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_capture(session, track).await;
        });
    }

    async fn run_capture(self: Arc<Self>, session: Arc<CallSession>, track: Arc<TrackRemote>) {
        let user_id = session.user_id;
        info!(user_id, "face capture started");
        let cancel = session.cancel.child_token();

        let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);
        let reader_cancel = cancel.clone();
        let max_late = self.capture.sample_buffer_max;
        tokio::spawn(async move {
            let clock_rate = track.codec().capability.clock_rate;
            let mut builder = SampleBuilder::new(max_late, Vp8Packet::default(), clock_rate);
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        debug!("rtp reader stopped");
                        return;
                    }
                    result = track.read_rtp() => {
                        let packet = match result {
                            Ok((packet, _attributes)) => packet,
                            Err(err) => {
                                debug!(error = %err, "rtp read ended");
                                return;
                            }
                        };
                        builder.push(packet);
                        while let Some(sample) = builder.pop() {
                            if sample_tx.send(sample).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        let mut state = CaptureState {
            last_capture: Instant::now(),
            total_attempts: 0,
            success_count: 0,
            sample_count: 0,
            first_keyframe: false,
        };

        let overall_deadline = tokio::time::sleep(self.capture.capture_timeout);
        tokio::pin!(overall_deadline);
        let keyframe_deadline = tokio::time::sleep(self.capture.pli_timeout);
        tokio::pin!(keyframe_deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(user_id, "capture cancelled");
                    return;
                }
                _ = &mut overall_deadline => {
                    warn!(user_id, "capture timed out");
                    self.handle_capture_failure(&session, "timeout").await;
                    return;
                }
                _ = &mut keyframe_deadline, if !state.first_keyframe => {
                    warn!(user_id, "no keyframe before deadline");
                    self.handle_capture_failure(&session, "pli_timeout").await;
                    return;
                }
                sample = sample_rx.recv() => {
                    let Some(sample) = sample else {
                        debug!(user_id, "video stream ended");
                        return;
                    };
                    state.sample_count += 1;
                    if state.sample_count == STREAM_ACTIVE_MARK {
                        debug!(user_id, "video stream active");
                    }

                    if !vp8::is_keyframe(&sample.data) {
                        continue;
                    }
                    if !state.first_keyframe {
                        state.first_keyframe = true;
                        info!(user_id, "first keyframe received");
                    }
                    if state.last_capture.elapsed() < self.capture.capture_interval {
                        continue;
                    }
                    state.last_capture = Instant::now();

                    let frame = match decode::decode_keyframe(&sample.data, &self.dims).await {
                        Ok(frame) => frame,
                        Err(err) => {
                            debug!(user_id, error = %err, "keyframe decode failed");
                            continue;
                        }
                    };

                    let attempt = state.total_attempts + 1;
                    let (submitted, response) =
                        self.detect_and_submit(user_id, &frame, attempt).await;
                    if !submitted {
                        continue;
                    }
                    state.total_attempts += 1;

                    match response {
                        Some(response) if response.identity_verified => {
                            state.success_count += 1;
                            info!(user_id, attempts = state.total_attempts, "identity verified");
                            self.handle_capture_success(&session, &response).await;
                            return;
                        }
                        _ => {
                            if state.total_attempts >= self.capture.max_attempts {
                                warn!(
                                    user_id,
                                    attempts = state.total_attempts,
                                    "attempt cap reached"
                                );
                                self.handle_capture_failure(&session, "max_attempts").await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run detection on the frame and, when a usable face is found, submit
    /// the crop. Returns whether a submission attempt was made and the
    /// recognition result when the call succeeded.
    async fn detect_and_submit(
        &self,
        user_id: i64,
        frame: &BgrFrame,
        attempt: u32,
    ) -> (bool, Option<RecognitionResponse>) {
        if !self.face.enabled {
            return (false, None);
        }
        let Some(detector) = &self.detector else {
            return (false, None);
        };

        let unresized_limit = self.dims.detection_width * 3 / 2;
        let target = if self.dims.skip_detection_resize && frame.width <= unresized_limit {
            None
        } else {
            Some(self.dims.detection_width)
        };
        let (gray, scale) = frame.to_gray_scaled(target);
        debug!(
            user_id,
            frame_width = frame.width,
            detect_width = gray.width(),
            "running detection"
        );

        let detector = Arc::clone(detector);
        let found = tokio::task::spawn_blocking(move || detector.detect(&gray))
            .await
            .unwrap_or_default();
        let candidates: Vec<Rect> = found.iter().map(|rect| rect.unscale(scale)).collect();

        let Some(face) = largest_valid_face(&candidates, self.face.min_face_size) else {
            if !candidates.is_empty() {
                debug!(
                    user_id,
                    faces = candidates.len(),
                    min = self.face.min_face_size,
                    "all faces below minimum size"
                );
            }
            return (false, None);
        };
        debug!(
            user_id,
            attempt,
            faces = candidates.len(),
            area = face.area(),
            "face selected"
        );

        let region = expand_and_center(face, frame.width, frame.height, self.dims.expand_ratio);
        let encoded = match crop_square_jpeg_base64(frame, region, self.face.jpeg_quality) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(user_id, error = %err, "crop encode failed");
                return (true, None);
            }
        };
        self.save_capture_debug(user_id, attempt, &encoded);

        info!(user_id, attempt, max = self.capture.max_attempts, "submitting image");
        match self.recognition.check_in(user_id, vec![encoded]).await {
            Ok(response) => (true, Some(response)),
            Err(err) => {
                warn!(user_id, error = %err, "recognition call failed");
                (true, None)
            }
        }
    }

    /// Best-effort copy of the submitted crop for operator debugging.
    fn save_capture_debug(&self, user_id: i64, attempt: u32, encoded: &str) {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        let Ok(bytes) = BASE64.decode(encoded) else {
            return;
        };
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let path = self
            .captures_dir
            .join(format!("{user_id}-{attempt}-{stamp}.jpg"));
        if let Err(err) = std::fs::write(&path, bytes) {
            debug!(error = %err, "capture debug write failed");
        }
    }

    async fn handle_capture_success(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        response: &RecognitionResponse,
    ) {
        let user_id = session.user_id;
        let channel_id = session.channel_id;

        if response.is_wfh {
            info!(user_id, "wfh check-in, no location confirmation needed");
            if let Err(err) = self.send_checkin_success(channel_id, user_id, "").await {
                warn!(user_id, error = %err, "success dm not sent");
            }
            self.queue_success_audio(user_id);
        } else {
            // The send keeps running even if this wait gives up, so the
            // confirmation window still arms on slow acks.
            let manager = Arc::clone(self);
            let name = response.full_name();
            let send = tokio::spawn(async move {
                manager
                    .send_checkin_confirmation(channel_id, user_id, &name)
                    .await
            });
            match tokio::time::timeout(CONFIRMATION_SEND_TIMEOUT, send).await {
                Ok(Ok(Ok(()))) => info!(user_id, "confirmation sent"),
                Ok(Ok(Err(err))) => warn!(user_id, error = %err, "confirmation dm failed"),
                Ok(Err(err)) => warn!(user_id, error = %err, "confirmation task failed"),
                Err(_) => warn!(user_id, "confirmation dm still pending"),
            }
        }

        self.schedule_end_call(user_id, "checkin_complete", AUDIO_FLUSH);

        // Let the prompt start streaming, then stop the media pipeline.
        tokio::time::sleep(AUDIO_FLUSH).await;
        session.cancel.cancel();
    }

    async fn handle_capture_failure(self: &Arc<Self>, session: &Arc<CallSession>, reason: &str) {
        let user_id = session.user_id;
        let channel_id = session.channel_id;
        warn!(user_id, reason, "capture failed");

        session.cancel.cancel();

        let message = match reason {
            "timeout" => "Hết thời gian chờ",
            "pli_timeout" => "Không nhận được video",
            "max_attempts" => "Không xác định được danh tính",
            _ => "Lỗi không xác định",
        };
        if let Err(err) = self.send_checkin_failed(channel_id, user_id, message).await {
            warn!(user_id, error = %err, "failure dm not sent");
        }
        self.play_checkin_fail_audio(user_id);
    }
}
