//! Per-call session state.
//!
//! A session owns the peer connection handle, the pending-ICE gate, the
//! cancellation token subordinate tasks hang off, and the two at-most-once
//! latches (cleanup and delayed end-call). Callbacks never hold the session
//! directly; they carry the user id and look the session up in the registry,
//! so a torn-down session simply stops being found.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

use crate::media::audio::AudioPlayer;

use super::CallError;

struct IceGate {
    ready: bool,
    pending: Vec<RTCIceCandidateInit>,
}

pub struct CallSession {
    pub user_id: i64,
    pub channel_id: i64,
    pc: Option<Arc<RTCPeerConnection>>,
    /// Stops the capture loop, the PLI emitter, and anything else spawned
    /// for this call. The only upward reference subordinate tasks hold.
    pub cancel: CancellationToken,
    /// Stops the audio worker. Separate from `cancel` so a failure prompt
    /// can still play while the media pipeline shuts down.
    pub audio_stop: CancellationToken,
    audio_player: Mutex<Option<Arc<AudioPlayer>>>,
    // Held across candidate application so queued candidates drain in
    // receipt order before any later arrival is applied.
    ice: tokio::sync::Mutex<IceGate>,
    cleanup_latch: AtomicBool,
    end_call_latch: AtomicBool,
    #[cfg(test)]
    pub(crate) applied_candidates: Mutex<Vec<String>>,
}

impl CallSession {
    pub fn new(user_id: i64, channel_id: i64, pc: Option<Arc<RTCPeerConnection>>) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            channel_id,
            pc,
            cancel: CancellationToken::new(),
            audio_stop: CancellationToken::new(),
            audio_player: Mutex::new(None),
            ice: tokio::sync::Mutex::new(IceGate {
                ready: false,
                pending: Vec::with_capacity(10),
            }),
            cleanup_latch: AtomicBool::new(false),
            end_call_latch: AtomicBool::new(false),
            #[cfg(test)]
            applied_candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_connection(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.pc.as_ref()
    }

    pub fn set_audio_player(&self, player: Arc<AudioPlayer>) {
        *self.audio_player.lock() = Some(player);
    }

    pub fn audio_player(&self) -> Option<Arc<AudioPlayer>> {
        self.audio_player.lock().clone()
    }

    /// First caller wins the right to run cleanup.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleanup_latch.swap(true, Ordering::SeqCst)
    }

    /// First caller wins the right to end the call.
    pub fn begin_end_call(&self) -> bool {
        !self.end_call_latch.swap(true, Ordering::SeqCst)
    }

    /// Queue a remote candidate until the answer is in place, then apply
    /// immediately. Applications happen under the gate lock, which is what
    /// keeps them in receipt order.
    pub async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), CallError> {
        let mut gate = self.ice.lock().await;
        if !gate.ready {
            gate.pending.push(candidate);
            debug!(
                user_id = self.user_id,
                queued = gate.pending.len(),
                "queued remote ice candidate"
            );
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    /// Flip the gate and drain queued candidates in the order they arrived.
    pub async fn release_pending_ice(&self) {
        let mut gate = self.ice.lock().await;
        gate.ready = true;
        let pending = std::mem::take(&mut gate.pending);
        if pending.is_empty() {
            return;
        }
        debug!(
            user_id = self.user_id,
            count = pending.len(),
            "applying pending ice candidates"
        );
        for candidate in pending {
            if let Err(err) = self.apply_candidate(candidate).await {
                warn!(user_id = self.user_id, error = %err, "pending ice candidate rejected");
            }
        }
    }

    async fn apply_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), CallError> {
        #[cfg(test)]
        self.applied_candidates.lock().push(candidate.candidate.clone());

        match &self.pc {
            Some(pc) => pc
                .add_ice_candidate(candidate)
                .await
                .map_err(CallError::Peer),
            None => Ok(()),
        }
    }

    pub async fn close_peer(&self) {
        if let Some(pc) = &self.pc {
            if let Err(err) = pc.close().await {
                warn!(user_id = self.user_id, error = %err, "peer connection close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pending_candidates_apply_in_receipt_order() {
        let session = CallSession::new(1, 2, None);
        for index in 0..5 {
            session
                .add_remote_candidate(candidate(&format!("c{index}")))
                .await
                .unwrap();
        }
        assert!(session.applied_candidates.lock().is_empty());

        session.release_pending_ice().await;
        assert_eq!(
            *session.applied_candidates.lock(),
            vec!["c0", "c1", "c2", "c3", "c4"]
        );

        // Later arrivals bypass the queue.
        session.add_remote_candidate(candidate("c5")).await.unwrap();
        assert_eq!(session.applied_candidates.lock().last().unwrap(), "c5");
    }

    #[tokio::test]
    async fn cleanup_latch_fires_once() {
        let session = CallSession::new(1, 2, None);
        assert!(session.begin_cleanup());
        assert!(!session.begin_cleanup());
        assert!(session.begin_end_call());
        assert!(!session.begin_end_call());
    }

    #[tokio::test]
    async fn concurrent_cleanup_claims_are_exclusive() {
        let session = CallSession::new(1, 2, None);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move { session.begin_cleanup() }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
