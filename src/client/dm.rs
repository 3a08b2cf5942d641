//! Direct messages: the DM-clan coordinator and the rich-message builders.
//!
//! The bot talks to users through DM channels that all live in one
//! designated clan. Joining that clan is deferred to the first send and
//! redone after every reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proto::{envelope, Envelope, DM_CLAN_ID};

use super::{Event, GatewayClient, GatewayError};

const CLAN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DM_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_POLL_ATTEMPTS: u32 = 10;

const COLOR_PURPLE: &str = "#71368A";
const COLOR_GREEN: &str = "#00FF00";
const COLOR_RED: &str = "#FF0000";

const FOOTER_TEXT: &str = "Powered by Mezon";
const FOOTER_ICON_URL: &str =
    "https://cdn.mezon.vn/1837043892743049216/1840654271217930240/1827994776956309500/857_0246x0w.webp";

pub const BUTTON_STYLE_SUCCESS: i32 = 3;
pub const BUTTON_STYLE_DANGER: i32 = 4;
const BUTTON_TYPE: i32 = 1;

/// Rich-message document serialized into `ChannelMessageSend.content`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "contentThread", skip_serializing_if = "Option::is_none")]
    pub content_thread: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embed: Vec<Embed>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(rename = "icon_url", skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(rename = "icon_url", skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: i32,
    pub component: ComponentDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<i32>,
}

pub struct ButtonSpec {
    pub id: String,
    pub label: String,
    pub style: i32,
}

fn embed(color: &str, title: &str, description: String) -> Embed {
    Embed {
        color: Some(color.to_string()),
        title: (!title.is_empty()).then(|| title.to_string()),
        description: Some(description),
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
        footer: Some(EmbedFooter {
            text: FOOTER_TEXT.into(),
            icon_url: Some(FOOTER_ICON_URL.into()),
        }),
        ..Default::default()
    }
}

pub fn build_checkin_confirmation(user_name: &str) -> MessageContent {
    MessageContent {
        embed: vec![embed(
            COLOR_PURPLE,
            "Xác định danh tính thành công - Cần xác minh vị trí",
            format!(
                "Xin chào {user_name}. Vui lòng gửi vị trí của bạn về cho hệ thống trong vòng 1 phút để hoàn thành check-in!"
            ),
        )],
        ..Default::default()
    }
}

pub fn build_checkin_success(user_name: &str) -> MessageContent {
    MessageContent {
        embed: vec![embed(
            COLOR_GREEN,
            "✅ Check-in thành công!",
            format!("Chào mừng {user_name}! Bạn đã check-in thành công."),
        )],
        ..Default::default()
    }
}

pub fn build_checkin_failed(reason: &str) -> MessageContent {
    MessageContent {
        embed: vec![embed(
            COLOR_RED,
            "❌ Check-in thất bại",
            format!("Lý do: {reason}"),
        )],
        ..Default::default()
    }
}

pub fn build_simple_text(text: &str) -> MessageContent {
    MessageContent {
        embed: vec![embed(COLOR_PURPLE, "", text.to_string())],
        ..Default::default()
    }
}

pub fn build_message_with_buttons(
    title: &str,
    description: &str,
    buttons: Vec<ButtonSpec>,
) -> MessageContent {
    MessageContent {
        embed: vec![embed(COLOR_PURPLE, title, description.to_string())],
        components: buttons
            .into_iter()
            .map(|button| Component {
                id: button.id,
                kind: BUTTON_TYPE,
                component: ComponentDetails {
                    label: Some(button.label),
                    style: Some(button.style),
                },
            })
            .collect(),
        ..Default::default()
    }
}

/// Sends DMs through the designated DM clan, joining it lazily.
pub struct DmCoordinator {
    client: Arc<GatewayClient>,
    ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl DmCoordinator {
    pub fn new(client: Arc<GatewayClient>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            client: Arc::clone(&client),
            ready: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        });

        // A reconnect lands on a fresh server session, so the clan join has
        // to happen again before the next DM.
        let weak = Arc::downgrade(&coordinator);
        client.on(Event::RECONNECTED, move |_| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                coordinator.ready.store(false, Ordering::SeqCst);
                if let Err(err) = coordinator.ensure_ready().await {
                    warn!(error = %err, "dm clan rejoin failed");
                }
            })
        });

        info!("dm coordinator created (lazy init)");
        coordinator
    }

    /// Send a rich message to a user's DM channel, waiting for the ack.
    pub async fn send_dm(
        &self,
        channel_id: i64,
        user_id: i64,
        content: &MessageContent,
    ) -> Result<(), GatewayError> {
        self.ensure_ready().await?;
        self.wait_for_connection().await?;

        let content_json = serde_json::to_string(content)
            .map_err(|err| GatewayError::Protocol(format!("content encode: {err}")))?;

        debug!(channel_id, user_id, "sending dm");
        let response = self
            .client
            .send_with_response(Envelope::dm_message(channel_id, content_json), DM_ACK_TIMEOUT)
            .await?;

        if let Some(envelope::Message::ChannelMessageAck(ack)) = response.message {
            debug!(
                message_id = ack.message_id,
                create_time = ack.create_time_seconds,
                "dm delivered"
            );
        }
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<(), GatewayError> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.client.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        info!(clan_id = DM_CLAN_ID, "initialising dm clan");
        self.client.join_clan(DM_CLAN_ID, CLAN_JOIN_TIMEOUT).await?;
        self.ready.store(true, Ordering::SeqCst);
        info!("dm clan ready");
        Ok(())
    }

    /// Ride out a reconnect in progress: poll for connectivity for up to
    /// five seconds before giving up on the send.
    async fn wait_for_connection(&self) -> Result<(), GatewayError> {
        if self.client.is_connected() {
            return Ok(());
        }
        warn!("gateway disconnected, waiting before dm send");
        for _ in 0..CONNECT_POLL_ATTEMPTS {
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            if self.client.is_connected() {
                debug!("connection restored");
                return Ok(());
            }
        }
        Err(GatewayError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_embed_is_purple_with_footer() {
        let content = build_checkin_confirmation("Minh Nguyen");
        assert_eq!(content.embed.len(), 1);
        let embed = &content.embed[0];
        assert_eq!(embed.color.as_deref(), Some(COLOR_PURPLE));
        assert!(embed.description.as_deref().unwrap().contains("Minh Nguyen"));
        assert_eq!(embed.footer.as_ref().unwrap().text, FOOTER_TEXT);
        assert!(embed.timestamp.is_some());
    }

    #[test]
    fn failure_embed_carries_reason() {
        let content = build_checkin_failed("Vị trí không hợp lệ");
        let embed = &content.embed[0];
        assert_eq!(embed.color.as_deref(), Some(COLOR_RED));
        assert_eq!(
            embed.description.as_deref(),
            Some("Lý do: Vị trí không hợp lệ")
        );
    }

    #[test]
    fn content_serializes_without_empty_fields() {
        let json = serde_json::to_value(build_checkin_success("An")).unwrap();
        assert!(json.get("t").is_none());
        assert!(json.get("components").is_none());
        assert_eq!(json["embed"][0]["color"], COLOR_GREEN);
    }

    #[test]
    fn buttons_map_to_components() {
        let content = build_message_with_buttons(
            "Title",
            "Body",
            vec![ButtonSpec {
                id: "ok".into(),
                label: "OK".into(),
                style: BUTTON_STYLE_SUCCESS,
            }],
        );
        assert_eq!(content.components.len(), 1);
        let component = &content.components[0];
        assert_eq!(component.kind, BUTTON_TYPE);
        assert_eq!(component.component.style, Some(BUTTON_STYLE_SUCCESS));
    }
}
