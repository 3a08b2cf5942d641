//! End-to-end gateway client tests against a local mock platform: a
//! minimal HTTP endpoint for authentication and a websocket server that
//! speaks the binary envelope protocol.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use checkin_bot::client::dm::build_checkin_success;
use checkin_bot::client::{DmCoordinator, GatewayClient, GatewayError};
use checkin_bot::config::{GatewayConfig, RetryPolicy};
use checkin_bot::proto::{envelope, ChannelMessageAck, ClanJoinAck, Envelope};

/// Serve one authentication request and answer with a session token that
/// redirects the realtime socket to `ws_port`.
async fn spawn_auth_server(ws_port: u16) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let (mut header_end, mut content_length) = (None, 0usize);
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if header_end.is_none() {
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            header_end = Some(pos + 4);
                            let headers = String::from_utf8_lossy(&buf[..pos]);
                            content_length = headers
                                .lines()
                                .find_map(|line| {
                                    let (name, value) = line.split_once(':')?;
                                    name.eq_ignore_ascii_case("content-length")
                                        .then(|| value.trim().parse().ok())?
                                })
                                .unwrap_or(0);
                        }
                    }
                    if let Some(end) = header_end {
                        if buf.len() >= end + content_length {
                            break;
                        }
                    }
                }

                let body = format!(
                    r#"{{"token":"test-token","refresh_token":"r1","created":true,"api_url":"http://127.0.0.1:{ws_port}"}}"#
                );
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

/// Websocket side of the mock platform: acks clan joins and DM sends,
/// ignores everything else (including pings).
async fn spawn_gateway_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut write, mut read) = ws.split();
                while let Some(Ok(message)) = read.next().await {
                    let Message::Binary(bytes) = message else {
                        continue;
                    };
                    let Ok(envelope) = Envelope::decode_frame(&bytes) else {
                        continue;
                    };
                    let reply = match envelope.message {
                        Some(envelope::Message::ClanJoin(join)) => Some(Envelope {
                            cid: envelope.cid.clone(),
                            message: Some(envelope::Message::ClanJoinAck(ClanJoinAck {
                                clan_id: join.clan_id,
                            })),
                        }),
                        Some(envelope::Message::ChannelMessageSend(_)) => Some(Envelope {
                            cid: envelope.cid.clone(),
                            message: Some(envelope::Message::ChannelMessageAck(
                                ChannelMessageAck {
                                    message_id: 555,
                                    create_time_seconds: 1_700_000_000,
                                },
                            )),
                        }),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if write
                            .send(Message::Binary(reply.encode_frame()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            });
        }
    });
    port
}

async fn connected_client() -> std::sync::Arc<GatewayClient> {
    let ws_port = spawn_gateway_server().await;
    let auth_port = spawn_auth_server(ws_port).await;
    let config = GatewayConfig {
        bot_id: 7,
        bot_token: "secret".into(),
        host: "127.0.0.1".into(),
        port: auth_port,
        use_ssl: false,
        socket_host: "127.0.0.1".into(),
        socket_port: auth_port,
        socket_use_ssl: false,
    };
    let client = GatewayClient::new(config, RetryPolicy::default()).unwrap();
    client.login().await.expect("login against mock platform");
    client
}

#[tokio::test]
async fn login_and_correlated_request_round_trip() {
    let client = connected_client().await;

    let response = client
        .join_clan(0, Duration::from_secs(2))
        .await
        .expect("clan join ack");
    assert!(!response.cid.is_empty());
    assert!(matches!(
        response.message,
        Some(envelope::Message::ClanJoinAck(ack)) if ack.clan_id == 0
    ));

    client.close().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let client = connected_client().await;

    let started = std::time::Instant::now();
    let result = client
        .send_with_response(Envelope::ping(), Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(GatewayError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));

    client.close().await;
}

#[tokio::test]
async fn dm_coordinator_joins_lazily_and_gets_ack() {
    let client = connected_client().await;
    let dm = DmCoordinator::new(client.clone());

    // First send performs the clan join, second one reuses it.
    dm.send_dm(42, 7, &build_checkin_success("An"))
        .await
        .expect("first dm");
    dm.send_dm(42, 7, &build_checkin_success("An"))
        .await
        .expect("second dm");

    client.close().await;
}
