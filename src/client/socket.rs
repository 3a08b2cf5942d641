//! Websocket transport: connect, framed reads, deadline-guarded writes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::proto::Envelope;

use super::{events, reconnect, GatewayClient, GatewayError, PING_INTERVAL, READ_TIMEOUT, WRITE_TIMEOUT};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// One live websocket connection. Writes are serialized through the sink
/// mutex and bounded by the write deadline.
pub(crate) struct Connection {
    writer: tokio::sync::Mutex<WsSink>,
}

impl Connection {
    pub(crate) async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        let mut writer = self.writer.lock().await;
        timeout(WRITE_TIMEOUT, writer.send(Message::Binary(bytes)))
            .await
            .map_err(|_| GatewayError::Transport("write deadline exceeded".into()))?
            .map_err(|err| GatewayError::Transport(format!("write failed: {err}")))
    }

    pub(crate) async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = timeout(Duration::from_secs(1), writer.send(Message::Close(None))).await;
    }
}

impl GatewayClient {
    /// Dial the realtime socket using the current session token, then start
    /// the reader and keepalive tasks.
    pub(crate) async fn connect_socket(self: &Arc<Self>) -> Result<(), GatewayError> {
        let url = {
            let session = self.session.read();
            let token = session
                .as_ref()
                .map(|s| s.token.clone())
                .ok_or_else(|| GatewayError::Protocol("no session, authenticate first".into()))?;
            self.config.read().websocket_endpoint(&token)
        };

        info!("connecting to gateway websocket");
        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|err| GatewayError::Transport(format!("websocket dial: {err}")))?;
        let (sink, stream) = stream.split();

        *self.conn.write().await = Some(Arc::new(Connection {
            writer: tokio::sync::Mutex::new(sink),
        }));

        let reader = Arc::clone(self);
        self.track_task(tokio::spawn(async move { run_reader(reader, stream).await }));
        let keepalive = Arc::clone(self);
        self.track_task(tokio::spawn(async move { run_keepalive(keepalive).await }));

        info!(client_id = self.client_id(), "connected to gateway");
        Ok(())
    }

    pub(crate) async fn write_frame(&self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        let conn = self
            .conn
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NotConnected)?;
        conn.send_binary(bytes).await
    }

    async fn process_frame(self: &Arc<Self>, bytes: &[u8]) {
        let envelope = match Envelope::decode_frame(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, frame_len = bytes.len(), "envelope decode error");
                return;
            }
        };
        if envelope.cid.is_empty() {
            events::route(self, envelope);
        } else {
            self.resolve_cid(envelope).await;
        }
    }
}

async fn run_reader(client: Arc<GatewayClient>, mut stream: WsStream) {
    loop {
        let frame = tokio::select! {
            _ = client.cancel.cancelled() => {
                debug!("reader stopped");
                return;
            }
            frame = timeout(READ_TIMEOUT, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                warn!("read deadline exceeded");
                reconnect::spawn(&client);
                return;
            }
            Ok(None) => {
                if !client.is_closed() {
                    warn!("websocket stream ended");
                    reconnect::spawn(&client);
                }
                return;
            }
            Ok(Some(Err(err))) => {
                if client.is_closed() {
                    return;
                }
                warn!(error = %err, "websocket read error");
                reconnect::spawn(&client);
                return;
            }
            Ok(Some(Ok(Message::Binary(data)))) => client.process_frame(&data).await,
            Ok(Some(Ok(Message::Text(text)))) => {
                debug!(len = text.len(), "unexpected text frame");
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn run_keepalive(client: Arc<GatewayClient>) {
    // Give the connection a beat to settle before the first ping.
    tokio::select! {
        _ = client.cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
    }
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => {
                debug!("keepalive stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        if client.is_closed() {
            return;
        }
        if let Err(err) = client.send(Envelope::ping()).await {
            warn!(error = %err, "ping failed");
            reconnect::spawn(&client);
            return;
        }
    }
}
