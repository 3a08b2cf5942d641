//! Wire envelope for the Mezon realtime gateway.
//!
//! Frames on the websocket are binary protobuf, one `Envelope` per frame. An
//! inbound envelope with a non-empty `cid` is the response to a request the
//! bot sent earlier; everything else is a server-initiated event. The structs
//! here are hand-written prost messages covering the subset of the platform
//! schema the bot exchanges.

use prost::Message as _;

/// Clan that hosts every bot<->user direct-message channel.
pub const DM_CLAN_ID: i64 = 0;

/// Channel mode for direct messages.
pub const DM_CHANNEL_MODE: i32 = 4;

/// `ChannelMessageEvent::code` marking a shared-location message.
pub const MESSAGE_CODE_LOCATION: i32 = 10;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Correlation id. Empty on fire-and-forget sends and on server events.
    #[prost(string, tag = "1")]
    pub cid: String,
    #[prost(
        oneof = "envelope::Message",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13"
    )]
    pub message: Option<envelope::Message>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "2")]
        Ping(super::Ping),
        #[prost(message, tag = "3")]
        Pong(super::Pong),
        #[prost(message, tag = "4")]
        Error(super::Error),
        #[prost(message, tag = "5")]
        ClanJoin(super::ClanJoin),
        #[prost(message, tag = "6")]
        ClanJoinAck(super::ClanJoinAck),
        #[prost(message, tag = "7")]
        ChannelJoin(super::ChannelJoin),
        #[prost(message, tag = "8")]
        ChannelJoinAck(super::ChannelJoinAck),
        #[prost(message, tag = "9")]
        ChannelMessageSend(super::ChannelMessageSend),
        #[prost(message, tag = "10")]
        ChannelMessageAck(super::ChannelMessageAck),
        #[prost(message, tag = "11")]
        ChannelMessageEvent(super::ChannelMessageEvent),
        #[prost(message, tag = "12")]
        UserChannelAdded(super::UserChannelAdded),
        #[prost(message, tag = "13")]
        WebrtcSignalingFwd(super::WebrtcSignalingFwd),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClanJoin {
    #[prost(int64, tag = "1")]
    pub clan_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClanJoinAck {
    #[prost(int64, tag = "1")]
    pub clan_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelJoin {
    #[prost(int64, tag = "1")]
    pub clan_id: i64,
    #[prost(int64, tag = "2")]
    pub channel_id: i64,
    #[prost(int32, tag = "3")]
    pub channel_type: i32,
    #[prost(bool, tag = "4")]
    pub is_public: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelJoinAck {
    #[prost(int64, tag = "1")]
    pub channel_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMessageSend {
    #[prost(int64, tag = "1")]
    pub clan_id: i64,
    #[prost(int64, tag = "2")]
    pub channel_id: i64,
    #[prost(int32, tag = "3")]
    pub mode: i32,
    #[prost(bool, tag = "4")]
    pub is_public: bool,
    /// Rich-message content as a UTF-8 JSON document.
    #[prost(string, tag = "5")]
    pub content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMessageAck {
    #[prost(int64, tag = "1")]
    pub message_id: i64,
    #[prost(int64, tag = "2")]
    pub create_time_seconds: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMessageEvent {
    #[prost(int64, tag = "1")]
    pub message_id: i64,
    #[prost(int64, tag = "2")]
    pub sender_id: i64,
    #[prost(int64, tag = "3")]
    pub channel_id: i64,
    #[prost(int64, tag = "4")]
    pub clan_id: i64,
    #[prost(int32, tag = "5")]
    pub code: i32,
    #[prost(string, tag = "6")]
    pub content: String,
    #[prost(string, tag = "7")]
    pub username: String,
    #[prost(string, tag = "8")]
    pub display_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelDescription {
    #[prost(int64, tag = "1")]
    pub channel_id: i64,
    #[prost(string, tag = "2")]
    pub channel_label: String,
    #[prost(int32, tag = "3")]
    pub channel_type: i32,
    /// 0 means public on the wire.
    #[prost(int32, tag = "4")]
    pub channel_private: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddedUser {
    #[prost(int64, tag = "1")]
    pub user_id: i64,
    #[prost(string, tag = "2")]
    pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserChannelAdded {
    #[prost(int64, tag = "1")]
    pub clan_id: i64,
    #[prost(message, optional, tag = "2")]
    pub channel_desc: Option<ChannelDescription>,
    #[prost(message, repeated, tag = "3")]
    pub users: Vec<AddedUser>,
    #[prost(message, optional, tag = "4")]
    pub caller: Option<AddedUser>,
    #[prost(string, tag = "5")]
    pub status: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebrtcSignalingFwd {
    #[prost(int64, tag = "1")]
    pub receiver_id: i64,
    #[prost(int64, tag = "2")]
    pub caller_id: i64,
    #[prost(int64, tag = "3")]
    pub channel_id: i64,
    #[prost(int32, tag = "4")]
    pub data_type: i32,
    #[prost(string, tag = "5")]
    pub json_data: String,
}

/// Payload kind carried by a [`WebrtcSignalingFwd`] envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Init,
    Offer,
    Answer,
    IceCandidate,
    Quit,
    Timeout,
    NotAvailable,
    JoinedOtherCall,
    StatusRemoteMedia,
}

impl SignalKind {
    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Init,
            1 => Self::Offer,
            2 => Self::Answer,
            3 => Self::IceCandidate,
            4 => Self::Quit,
            5 => Self::Timeout,
            6 => Self::NotAvailable,
            7 => Self::JoinedOtherCall,
            8 => Self::StatusRemoteMedia,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Init => 0,
            Self::Offer => 1,
            Self::Answer => 2,
            Self::IceCandidate => 3,
            Self::Quit => 4,
            Self::Timeout => 5,
            Self::NotAvailable => 6,
            Self::JoinedOtherCall => 7,
            Self::StatusRemoteMedia => 8,
        }
    }
}

impl Envelope {
    pub fn new(message: envelope::Message) -> Self {
        Self {
            cid: String::new(),
            message: Some(message),
        }
    }

    pub fn ping() -> Self {
        Self::new(envelope::Message::Ping(Ping {}))
    }

    pub fn clan_join(clan_id: i64) -> Self {
        Self::new(envelope::Message::ClanJoin(ClanJoin { clan_id }))
    }

    pub fn channel_join(clan_id: i64, channel_id: i64, channel_type: i32, is_public: bool) -> Self {
        Self::new(envelope::Message::ChannelJoin(ChannelJoin {
            clan_id,
            channel_id,
            channel_type,
            is_public,
        }))
    }

    pub fn dm_message(channel_id: i64, content_json: String) -> Self {
        Self::new(envelope::Message::ChannelMessageSend(ChannelMessageSend {
            clan_id: DM_CLAN_ID,
            channel_id,
            mode: DM_CHANNEL_MODE,
            is_public: false,
            content: content_json,
        }))
    }

    pub fn webrtc_signal(
        receiver_id: i64,
        caller_id: i64,
        channel_id: i64,
        kind: SignalKind,
        json_data: String,
    ) -> Self {
        Self::new(envelope::Message::WebrtcSignalingFwd(WebrtcSignalingFwd {
            receiver_id,
            caller_id,
            channel_id,
            data_type: kind.to_wire(),
            json_data,
        }))
    }

    /// The server error carried by this envelope, if any.
    pub fn server_error(&self) -> Option<&Error> {
        match &self.message {
            Some(envelope::Message::Error(err)) => Some(err),
            _ => None,
        }
    }

    pub fn encode_frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .expect("encoding to a Vec cannot fail");
        buf
    }

    pub fn decode_frame(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_cid() {
        let mut env = Envelope::webrtc_signal(7, 42, 99, SignalKind::Offer, "{}".into());
        env.cid = "17".into();
        let decoded = Envelope::decode_frame(&env.encode_frame()).unwrap();
        assert_eq!(decoded.cid, "17");
        let Some(envelope::Message::WebrtcSignalingFwd(fwd)) = decoded.message else {
            panic!("expected a forwarded webrtc signal");
        };
        assert_eq!(fwd.receiver_id, 7);
        assert_eq!(fwd.caller_id, 42);
        assert_eq!(fwd.channel_id, 99);
        assert_eq!(SignalKind::from_wire(fwd.data_type), Some(SignalKind::Offer));
    }

    #[test]
    fn dm_message_targets_the_dm_clan() {
        let env = Envelope::dm_message(5, "{\"t\":\"hi\"}".into());
        let Some(envelope::Message::ChannelMessageSend(send)) = env.message else {
            panic!("expected a channel message send");
        };
        assert_eq!(send.clan_id, DM_CLAN_ID);
        assert_eq!(send.mode, DM_CHANNEL_MODE);
        assert!(!send.is_public);
    }

    #[test]
    fn server_error_is_surfaced() {
        let env = Envelope::new(envelope::Message::Error(Error {
            code: 16,
            message: "unauthenticated".into(),
        }));
        let err = env.server_error().unwrap();
        assert_eq!(err.code, 16);
        assert!(Envelope::ping().server_error().is_none());
    }

    #[test]
    fn unknown_signal_kind_is_rejected() {
        assert_eq!(SignalKind::from_wire(9), None);
        for wire in 0..=8 {
            assert_eq!(SignalKind::from_wire(wire).unwrap().to_wire(), wire);
        }
    }
}
