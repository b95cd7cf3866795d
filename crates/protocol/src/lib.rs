//! Realtime protocol: frame types exchanged over the persistent transport
//! and the JSON codec used to put them on the wire.
//!
//! Every frame is a [`ProtocolMessage`] whose `action` selects its meaning.
//! Connection lifecycle frames (`connect`, `connected`, `disconnected`,
//! `close`, `closed`, `error`, `auth`) carry connection fields; channel
//! frames (`attach`, `attached`, `detach`, `detached`, `message`) carry a
//! `channel`; `ack`/`nack` carry a `msgSerial` + `count` range.

pub mod action;
pub mod frame;
pub mod message;

pub use action::{flags, Action, UnknownAction};
pub use frame::{AuthDetails, ConnectionDetails, ProtocolMessage};
pub use message::Message;

/// Encode a frame as a JSON text payload.
pub fn encode(frame: &ProtocolMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a JSON text payload into a frame.
pub fn decode(text: &str) -> Result<ProtocolMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_connected_frame() {
        let frame = decode(
            r#"{
                "action": 4,
                "connectionId": "conn-1",
                "connectionKey": "key-1",
                "connectionDetails": {
                    "clientId": "alice",
                    "connectionKey": "key-1",
                    "maxMessageSize": 16384,
                    "connectionStateTtl": 60000,
                    "maxIdleInterval": 15000
                }
            }"#,
        )
        .unwrap();
        assert_eq!(frame.action, Action::Connected);
        assert_eq!(frame.connection_id.as_deref(), Some("conn-1"));
        let details = frame.connection_details.unwrap();
        assert_eq!(details.max_message_size, Some(16384));
        assert_eq!(details.connection_state_ttl_ms, Some(60_000));
        assert_eq!(details.max_idle_interval_ms, Some(15_000));
    }

    #[test]
    fn encodes_action_as_integer_and_skips_empty_fields() {
        let text = encode(&ProtocolMessage::attach("chat")).unwrap();
        assert_eq!(text, r#"{"action":10,"channel":"chat"}"#);
    }

    #[test]
    fn unknown_action_is_a_decode_error() {
        assert!(decode(r#"{"action":99}"#).is_err());
    }
}
