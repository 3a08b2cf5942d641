//! Gateway client: the authenticated realtime channel to the chat platform.
//!
//! One [`GatewayClient`] owns the websocket connection, the correlation-id
//! registry for request/response envelopes, and the event bus that fans
//! server events out to subsystems. A reader task and a keepalive task run
//! per connection; a failed read or ping hands control to the reconnect
//! controller unless the client was closed on purpose.

pub mod auth;
pub mod dm;
mod events;
mod reconnect;
mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, RetryPolicy};
use crate::proto::{self, Envelope, SignalKind};

pub use auth::AuthSession;
pub use dm::{DmCoordinator, MessageContent};

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(90);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the reader will wait on a response slot before dropping the
/// envelope; the waiter may already have timed out and gone away.
const PENDING_DELIVERY_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("timed out waiting for response")]
    Timeout,
    #[error("server error: code={code}, message={message}")]
    Remote {
        code: i32,
        message: String,
        envelope: Box<Envelope>,
    },
    #[error("client is closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Server events the bus can deliver.
#[derive(Clone)]
pub enum Event {
    UserChannelAdded(proto::UserChannelAdded),
    ChannelMessage(proto::ChannelMessageEvent),
    WebrtcSignal(proto::WebrtcSignalingFwd),
    Reconnected,
}

impl Event {
    pub const USER_CHANNEL_ADDED: &'static str = "user_channel_added";
    pub const CHANNEL_MESSAGE: &'static str = "channel_message";
    pub const WEBRTC_SIGNALING: &'static str = "webrtc_signaling_fwd";
    pub const RECONNECTED: &'static str = "reconnected";

    pub fn name(&self) -> &'static str {
        match self {
            Event::UserChannelAdded(_) => Self::USER_CHANNEL_ADDED,
            Event::ChannelMessage(_) => Self::CHANNEL_MESSAGE,
            Event::WebrtcSignal(_) => Self::WEBRTC_SIGNALING,
            Event::Reconnected => Self::RECONNECTED,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct GatewayClient {
    client_id: i64,
    pub(crate) config: RwLock<GatewayConfig>,
    retry: RetryPolicy,
    pub(crate) http: reqwest::Client,
    pub(crate) session: RwLock<Option<AuthSession>>,
    pub(crate) conn: tokio::sync::RwLock<Option<Arc<socket::Connection>>>,
    pending: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    next_cid: AtomicU64,
    handlers: RwLock<HashMap<&'static str, Vec<EventHandler>>>,
    auto_join: AtomicBool,
    retrying: AtomicBool,
    hard_closed: AtomicBool,
    closed_once: AtomicBool,
    pub(crate) cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, retry: RetryPolicy) -> Result<Arc<Self>, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let client = Arc::new(Self {
            client_id: config.bot_id,
            config: RwLock::new(config),
            retry,
            http,
            session: RwLock::new(None),
            conn: tokio::sync::RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_cid: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            auto_join: AtomicBool::new(true),
            retrying: AtomicBool::new(false),
            hard_closed: AtomicBool::new(false),
            closed_once: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        events::register_builtin_handlers(&client);
        Ok(client)
    }

    /// The bot's own user id on the platform.
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Authenticate over HTTP and connect the realtime socket.
    pub async fn login(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.authenticate().await?;
        self.connect_socket().await?;
        Ok(())
    }

    /// Hard close: no reconnect, cancel every task, close the socket.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hard_closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(conn) = self.conn.write().await.take() {
            conn.close().await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
            warn!("shutdown timed out waiting for client tasks");
        }
        info!("gateway client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.hard_closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed()
            && self
                .conn
                .try_read()
                .map(|guard| guard.is_some())
                .unwrap_or(true)
    }

    pub fn set_auto_join(&self, enabled: bool) {
        self.auto_join.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_join_enabled(&self) -> bool {
        self.auto_join.load(Ordering::SeqCst)
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    // ---- event bus ----

    /// Register a handler for a named event. Handlers run on fresh tasks;
    /// a panicking handler never takes the bus down.
    pub fn on<F>(&self, event: &'static str, handler: F)
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event)
            .or_default()
            .push(Arc::new(handler));
    }

    pub(crate) fn emit(&self, event: Event) {
        let name = event.name();
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(name)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for handler in handlers {
            let event = event.clone();
            let handle = tokio::spawn(async move {
                use futures_util::FutureExt;
                let fut = std::panic::AssertUnwindSafe(handler(event));
                if fut.catch_unwind().await.is_err() {
                    warn!(event = name, "event handler panicked");
                }
            });
            self.track_task(handle);
        }
    }

    // ---- correlated sends ----

    fn generate_cid(&self) -> String {
        self.next_cid.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Fire-and-forget send. The correlation id is cleared.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), GatewayError> {
        envelope.cid.clear();
        self.write_frame(envelope.encode_frame()).await
    }

    /// Send an envelope and wait for its correlated response. Exactly one of
    /// three things happens: the matching response arrives, the timeout
    /// elapses, or the client shuts down. The pending slot is removed on
    /// every path.
    pub async fn send_with_response(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, GatewayError> {
        if self.conn.read().await.is_none() {
            return Err(GatewayError::NotConnected);
        }

        let cid = self.generate_cid();
        envelope.cid = cid.clone();

        let (tx, mut rx) = mpsc::channel(1);
        self.pending.lock().insert(cid.clone(), tx);
        let _slot = PendingSlot { client: self, cid: &cid };

        debug!(cid = %cid, "sending correlated envelope");
        self.write_frame(envelope.encode_frame()).await?;

        tokio::select! {
            response = rx.recv() => match response {
                Some(envelope) => {
                    if let Some(err) = envelope.server_error() {
                        let (code, message) = (err.code, err.message.clone());
                        Err(GatewayError::Remote { code, message, envelope: Box::new(envelope) })
                    } else {
                        Ok(envelope)
                    }
                }
                None => Err(GatewayError::Closed),
            },
            _ = tokio::time::sleep(timeout) => Err(GatewayError::Timeout),
            _ = self.cancel.cancelled() => Err(GatewayError::Closed),
        }
    }

    /// Deliver a response envelope to its waiter, if any is still around.
    pub(crate) async fn resolve_cid(&self, envelope: Envelope) {
        let cid = envelope.cid.clone();
        let slot = self.pending.lock().get(&cid).cloned();
        match slot {
            Some(tx) => {
                if tx
                    .send_timeout(envelope, PENDING_DELIVERY_TIMEOUT)
                    .await
                    .is_err()
                {
                    warn!(cid = %cid, "response slot reclaimed, dropping envelope");
                }
            }
            None => debug!(cid = %cid, "no pending request for response"),
        }
    }

    // ---- protocol helpers ----

    pub async fn send_webrtc_signal(
        &self,
        receiver_id: i64,
        caller_id: i64,
        channel_id: i64,
        kind: SignalKind,
        json_data: String,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        self.send(Envelope::webrtc_signal(
            receiver_id,
            caller_id,
            channel_id,
            kind,
            json_data,
        ))
        .await
    }

    pub async fn join_channel(
        &self,
        clan_id: i64,
        channel_id: i64,
        channel_type: i32,
        is_public: bool,
    ) -> Result<(), GatewayError> {
        debug!(clan_id, channel_id, channel_type, is_public, "joining channel");
        self.send(Envelope::channel_join(
            clan_id,
            channel_id,
            channel_type,
            is_public,
        ))
        .await
    }

    pub async fn join_clan(
        &self,
        clan_id: i64,
        timeout: Duration,
    ) -> Result<Envelope, GatewayError> {
        debug!(clan_id, "joining clan");
        self.send_with_response(Envelope::clan_join(clan_id), timeout)
            .await
    }
}

/// Removes the pending entry when the waiting future completes or is
/// dropped, keeping the cid registry leak-free.
struct PendingSlot<'a> {
    client: &'a GatewayClient,
    cid: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.client.pending.lock().remove(self.cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Arc<GatewayClient> {
        let config = GatewayConfig {
            bot_id: 1,
            bot_token: "token".into(),
            host: "localhost".into(),
            port: 7350,
            use_ssl: false,
            socket_host: "localhost".into(),
            socket_port: 7350,
            socket_use_ssl: false,
        };
        GatewayClient::new(config, RetryPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn cid_allocator_never_repeats() {
        let client = test_client();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(client.generate_cid()));
        }
    }

    #[tokio::test]
    async fn send_with_response_requires_connection() {
        let client = test_client();
        let result = client
            .send_with_response(Envelope::ping(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn resolve_cid_drops_when_no_waiter() {
        let client = test_client();
        let mut envelope = Envelope::ping();
        envelope.cid = "42".into();
        // Must not hang or panic with nobody waiting.
        client.resolve_cid(envelope).await;
    }

    #[tokio::test]
    async fn handler_panic_is_isolated() {
        let client = test_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(Event::RECONNECTED, move |_| {
            Box::pin(async move { panic!("boom") })
        });
        client.on(Event::RECONNECTED, move |_| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(());
            })
        });
        client.emit(Event::Reconnected);
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("second handler should still run")
            .expect("channel open");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = test_client();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert!(!client.is_connected());
    }
}
