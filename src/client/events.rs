//! Envelope-to-event routing and the built-in auto-join policy.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::proto::{envelope, Envelope, UserChannelAdded};

use super::{Event, GatewayClient};

/// Classify a server-initiated envelope and fan it out on the bus. Acks and
/// server errors only produce log lines.
pub(crate) fn route(client: &Arc<GatewayClient>, envelope: Envelope) {
    let Some(message) = envelope.message else {
        debug!("envelope without body");
        return;
    };
    match message {
        envelope::Message::Pong(_) => debug!("pong received"),
        envelope::Message::Ping(_) => debug!("ping received"),
        envelope::Message::Error(err) => {
            warn!(code = err.code, message = %err.message, "server error");
        }
        envelope::Message::ClanJoinAck(ack) => {
            debug!(clan_id = ack.clan_id, "clan join confirmed");
        }
        envelope::Message::ClanJoin(join) => {
            debug!(clan_id = join.clan_id, "clan join echoed");
        }
        envelope::Message::ChannelJoinAck(ack) => {
            debug!(channel_id = ack.channel_id, "channel join confirmed");
        }
        envelope::Message::ChannelJoin(join) => {
            debug!(channel_id = join.channel_id, "channel join echoed");
        }
        envelope::Message::ChannelMessageAck(ack) => {
            debug!(
                message_id = ack.message_id,
                create_time = ack.create_time_seconds,
                "message ack received"
            );
        }
        envelope::Message::ChannelMessageSend(_) => {}
        envelope::Message::ChannelMessageEvent(event) => {
            debug!(
                sender_id = event.sender_id,
                channel_id = event.channel_id,
                code = event.code,
                "channel message received"
            );
            client.emit(Event::ChannelMessage(event));
        }
        envelope::Message::UserChannelAdded(event) => {
            info!(clan_id = event.clan_id, users = event.users.len(), "user channel added");
            client.emit(Event::UserChannelAdded(event));
        }
        envelope::Message::WebrtcSignalingFwd(signal) => {
            debug!(data_type = signal.data_type, "webrtc signal received");
            client.emit(Event::WebrtcSignal(signal));
        }
    }
}

/// Handlers the client installs on itself: the auto-join policy.
pub(crate) fn register_builtin_handlers(client: &Arc<GatewayClient>) {
    let weak = Arc::downgrade(client);
    client.on(Event::USER_CHANNEL_ADDED, move |event| {
        let weak = Weak::clone(&weak);
        Box::pin(async move {
            let (Some(client), Event::UserChannelAdded(added)) = (weak.upgrade(), event) else {
                return;
            };
            handle_user_channel_added(&client, added).await;
        })
    });
}

async fn handle_user_channel_added(client: &Arc<GatewayClient>, event: UserChannelAdded) {
    let Some(desc) = &event.channel_desc else {
        warn!("user_channel_added without channel description");
        return;
    };
    if !client.auto_join_enabled() {
        return;
    }
    let includes_bot = event
        .users
        .iter()
        .any(|user| user.user_id == client.client_id());
    if !includes_bot {
        debug!("bot not in added users, skipping auto-join");
        return;
    }

    info!(
        channel_id = desc.channel_id,
        label = %desc.channel_label,
        "auto-joining channel"
    );
    if let Err(err) = client
        .join_channel(
            event.clan_id,
            desc.channel_id,
            desc.channel_type,
            desc.channel_private == 0,
        )
        .await
    {
        warn!(channel_id = desc.channel_id, error = %err, "auto-join failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RetryPolicy};
    use crate::proto::{AddedUser, ChannelDescription};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_client() -> Arc<GatewayClient> {
        GatewayClient::new(
            GatewayConfig {
                bot_id: 99,
                bot_token: "token".into(),
                host: "localhost".into(),
                port: 80,
                use_ssl: false,
                socket_host: "localhost".into(),
                socket_port: 80,
                socket_use_ssl: false,
            },
            RetryPolicy::default(),
        )
        .unwrap()
    }

    fn added_event(user_ids: &[i64]) -> Event {
        Event::UserChannelAdded(UserChannelAdded {
            clan_id: 1,
            channel_desc: Some(ChannelDescription {
                channel_id: 5,
                channel_label: "call".into(),
                channel_type: 4,
                channel_private: 1,
            }),
            users: user_ids
                .iter()
                .map(|&user_id| AddedUser {
                    user_id,
                    username: String::new(),
                })
                .collect(),
            caller: None,
            status: String::new(),
        })
    }

    #[tokio::test]
    async fn routed_events_reach_subscribers() {
        let client = test_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(Event::CHANNEL_MESSAGE, move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Event::ChannelMessage(message) = event {
                    let _ = tx.send(message.sender_id);
                }
            })
        });

        let envelope = Envelope::new(envelope::Message::ChannelMessageEvent(
            crate::proto::ChannelMessageEvent {
                sender_id: 12,
                ..Default::default()
            },
        ));
        route(&client, envelope);

        let sender = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sender, 12);
    }

    #[tokio::test]
    async fn auto_join_skips_when_bot_not_listed() {
        let client = test_client();
        // Would hit the (absent) socket and error if it tried to join; the
        // quiet path is the assertion here.
        handle_user_channel_added(
            &client,
            match added_event(&[1, 2, 3]) {
                Event::UserChannelAdded(event) => event,
                _ => unreachable!(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn auto_join_can_be_disabled() {
        let client = test_client();
        client.set_auto_join(false);
        handle_user_channel_added(
            &client,
            match added_event(&[99]) {
                Event::UserChannelAdded(event) => event,
                _ => unreachable!(),
            },
        )
        .await;
        client.set_auto_join(true);
        assert!(client.auto_join_enabled());
    }
}
