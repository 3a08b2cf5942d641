//! Prompt audio playback.
//!
//! Each call gets one [`AudioPlayer`] bound to the outbound Opus track. A
//! single worker drains a queue of prompt items and streams OGG pages onto
//! the track, pacing writes by the page duration derived from the granule
//! position so playback stays real time.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::MediaError;

const QUEUE_DEPTH: usize = 10;
const OPUS_SAMPLE_RATE: u64 = 48_000;
const DEFAULT_PAGE_DURATION: Duration = Duration::from_millis(20);

/// One prompt to play. `on_finish` runs after the item finishes or errors,
/// which is how the welcome prompt chains into background music.
pub struct PromptItem {
    pub path: String,
    pub name: String,
    pub looped: bool,
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl PromptItem {
    pub fn once(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            looped: false,
            on_finish: None,
        }
    }
}

#[derive(Default)]
struct PlayStatus {
    is_playing: bool,
    current: String,
}

/// Per-session prompt queue and playback worker.
pub struct AudioPlayer {
    track: Arc<TrackLocalStaticSample>,
    queue: Mutex<VecDeque<PromptItem>>,
    wakeup: Notify,
    stop: CancellationToken,
    // Set by play_now; the current prompt yields at the next page boundary.
    interrupt: std::sync::atomic::AtomicBool,
    status: Mutex<PlayStatus>,
}

impl AudioPlayer {
    /// Create the player and start its worker. The worker exits when `stop`
    /// is cancelled; cancelling twice is harmless.
    pub fn new(track: Arc<TrackLocalStaticSample>, stop: CancellationToken) -> Arc<Self> {
        let player = Arc::new(Self {
            track,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            stop,
            interrupt: std::sync::atomic::AtomicBool::new(false),
            status: Mutex::new(PlayStatus::default()),
        });
        let worker = Arc::clone(&player);
        tokio::spawn(async move { worker.run().await });
        player
    }

    /// Queue a prompt behind whatever is already playing.
    pub fn play(&self, item: PromptItem) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= QUEUE_DEPTH {
                warn!(name = %item.name, "prompt queue full, dropping");
                return;
            }
            debug!(name = %item.name, "queued prompt");
            queue.push_back(item);
        }
        self.wakeup.notify_one();
    }

    /// Drop everything queued and play this prompt, bumping the current one
    /// off the track at its next page boundary.
    pub fn play_now(&self, item: PromptItem) {
        self.queue.lock().clear();
        self.interrupt
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.play(item);
    }

    pub fn status(&self) -> (bool, String, usize) {
        let status = self.status.lock();
        (
            status.is_playing,
            status.current.clone(),
            self.queue.lock().len(),
        )
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("audio player stopped");
                    return;
                }
                _ = self.wakeup.notified() => {}
            }
            while let Some(item) = self.pop() {
                self.play_item(item).await;
                if self.stop.is_cancelled() {
                    return;
                }
            }
        }
    }

    fn pop(&self) -> Option<PromptItem> {
        self.queue.lock().pop_front()
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn play_item(&self, item: PromptItem) {
        self.interrupt
            .store(false, std::sync::atomic::Ordering::SeqCst);
        {
            let mut status = self.status.lock();
            status.is_playing = true;
            status.current = item.name.clone();
        }
        debug!(name = %item.name, "playing prompt");

        loop {
            if let Err(err) = self.stream_ogg(&item.path).await {
                warn!(name = %item.name, error = %err, "prompt playback failed");
                break;
            }
            if !item.looped || self.stop.is_cancelled() || self.interrupted() {
                break;
            }
            debug!(name = %item.name, "looping prompt");
        }

        {
            let mut status = self.status.lock();
            status.is_playing = false;
            status.current.clear();
        }
        if let Some(on_finish) = item.on_finish {
            on_finish();
        }
    }

    /// Stream one OGG/Opus file page-by-page onto the track. Page reads stop
    /// at end of stream; pacing sleeps are interruptible by the stop token.
    async fn stream_ogg(&self, path: &str) -> Result<(), MediaError> {
        let file = File::open(path)?;
        let (mut ogg, _header) = OggReader::new(BufReader::new(file), true)
            .map_err(|err| MediaError::Decoder(format!("ogg open: {err}")))?;

        let mut last_granule: u64 = 0;
        loop {
            if self.stop.is_cancelled() || self.interrupted() {
                return Ok(());
            }

            let (page_data, page_header) = match ogg.parse_next_page() {
                Ok(page) => page,
                // End of stream (or a torn trailing page); playback is done.
                Err(err) => {
                    debug!(error = %err, "ogg stream ended");
                    return Ok(());
                }
            };

            let mut duration = Duration::ZERO;
            if last_granule != 0 && page_header.granule_position > last_granule {
                let samples = page_header.granule_position - last_granule;
                duration = Duration::from_millis(samples * 1000 / OPUS_SAMPLE_RATE);
            }
            last_granule = page_header.granule_position;
            if duration.is_zero() {
                duration = DEFAULT_PAGE_DURATION;
            }

            self.track
                .write_sample(&Sample {
                    data: page_data.into(),
                    duration,
                    ..Default::default()
                })
                .await?;

            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = sleep(duration) => {}
            }
        }
    }
}

/// Named prompt files validated at startup.
#[derive(Default)]
pub struct AudioLibrary {
    sounds: RwLock<HashMap<String, String>>,
}

impl AudioLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt file. Missing files are rejected so a broken deploy
    /// surfaces at startup rather than mid-call.
    pub fn register(&self, name: &str, path: &str) -> Result<(), MediaError> {
        if !std::path::Path::new(path).exists() {
            return Err(MediaError::Decoder(format!("audio file not found: {path}")));
        }
        self.sounds
            .write()
            .insert(name.to_string(), path.to_string());
        debug!(name, path, "registered audio");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.sounds.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.sounds.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_rejects_missing_files() {
        let library = AudioLibrary::new();
        assert!(library.register("welcome", "/nonexistent/welcome.ogg").is_err());
        assert!(library.get("welcome").is_none());
    }

    #[test]
    fn library_returns_registered_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("welcome.ogg");
        std::fs::write(&path, b"OggS").unwrap();

        let library = AudioLibrary::new();
        library
            .register("welcome", path.to_str().unwrap())
            .unwrap();
        assert_eq!(library.get("welcome").as_deref(), path.to_str());
        assert_eq!(library.names(), vec!["welcome".to_string()]);
    }
}
