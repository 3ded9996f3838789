//! Caption channel wire format: Socket.IO v5 packets carried in Engine.IO v4
//! frames over a websocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const ENGINE_IO_VERSION: &str = "4";
pub const TRANSLATION_RESULT_EVENT: &str = "translation_result";
const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        payload: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        payload: Value,
    },
}

impl SocketPacket {
    pub fn connect_default() -> Self {
        Self::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            payload: None,
        }
    }

    pub fn disconnect_default() -> Self {
        Self::Disconnect {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }

    fn type_char(&self) -> char {
        match self {
            Self::Connect { .. } => '0',
            Self::Disconnect { .. } => '1',
            Self::Event { .. } => '2',
            Self::Ack { .. } => '3',
            Self::ConnectError { .. } => '4',
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.type_char());
        let namespace = self.namespace();
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }
        match self {
            Self::Connect { payload, .. } => {
                if let Some(payload) = payload {
                    out.push_str(&payload.to_string());
                }
            }
            Self::Disconnect { .. } => {}
            Self::Event {
                ack_id, name, args, ..
            } => {
                if let Some(ack_id) = ack_id {
                    out.push_str(&ack_id.to_string());
                }
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                out.push_str(&Value::Array(array).to_string());
            }
            Self::Ack { ack_id, args, .. } => {
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            Self::ConnectError { payload, .. } => out.push_str(&payload.to_string()),
        }
        out
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(ProtocolError::Malformed(
                "binary socket.io packets are not supported".to_string(),
            ));
        }
        if !matches!(kind, '0'..='4') {
            return Err(ProtocolError::UnknownSocketPacket(kind));
        }

        let (namespace, rest) = split_namespace(rest);
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (ack_digits, body) = rest.split_at(digits);
        let ack_id = if ack_digits.is_empty() {
            None
        } else {
            Some(
                ack_digits
                    .parse::<u64>()
                    .map_err(|err| ProtocolError::Malformed(err.to_string()))?,
            )
        };

        match kind {
            '0' => Ok(Self::Connect {
                namespace,
                payload: parse_optional_json(body)?,
            }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let mut items = parse_array(body)?.into_iter();
                let name = match items.next() {
                    Some(Value::String(name)) => name,
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "event packet must start with an event name".to_string(),
                        ))
                    }
                };
                Ok(Self::Event {
                    namespace,
                    ack_id,
                    name,
                    args: items.collect(),
                })
            }
            '3' => Ok(Self::Ack {
                namespace,
                ack_id: ack_id.ok_or_else(|| {
                    ProtocolError::Malformed("ack packet without id".to_string())
                })?,
                args: parse_array(body)?,
            }),
            _ => Ok(Self::ConnectError {
                namespace,
                payload: parse_optional_json(body)?.unwrap_or(Value::Null),
            }),
        }
    }
}

fn split_namespace(rest: &str) -> (String, &str) {
    if rest.starts_with('/') {
        if let Some((namespace, tail)) = rest.split_once(',') {
            return (namespace.to_string(), tail);
        }
        return (rest.to_string(), "");
    }
    (DEFAULT_NAMESPACE.to_string(), rest)
}

fn parse_optional_json(body: &str) -> Result<Option<Value>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(body)?))
}

fn parse_array(body: &str) -> Result<Vec<Value>, ProtocolError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Array(items) => Ok(items),
        other => Err(ProtocolError::Malformed(format!(
            "expected json array, got {other}"
        ))),
    }
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            Self::Open(payload) => {
                format!("0{}", serde_json::to_string(payload).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(packet) => format!("4{}", packet.encode()),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(rest.to_string())),
            '3' => Ok(Self::Pong(rest.to_string())),
            '4' => Ok(Self::Message(SocketPacket::decode(rest)?)),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ProtocolError::UnknownEnginePacket(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub text: String,
}

/// Application events the caption backend pushes to participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionChannelEvent {
    TranslationResult(TranslationResult),
}

impl CaptionChannelEvent {
    /// Maps a socket.io event onto a caption event; unknown names yield `None`.
    pub fn from_socket_event(name: &str, args: &[Value]) -> Result<Option<Self>, ProtocolError> {
        match name {
            TRANSLATION_RESULT_EVENT => {
                let payload = args.first().cloned().ok_or_else(|| {
                    ProtocolError::Malformed("translation_result without payload".to_string())
                })?;
                let result: TranslationResult = serde_json::from_value(payload)?;
                Ok(Some(Self::TranslationResult(result)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_open_handshake() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("open");

        match packet {
            EnginePacket::Open(open) => {
                assert_eq!(open.sid, "abc");
                assert_eq!(open.ping_interval, 25000);
                assert_eq!(open.ping_timeout, 20000);
                assert_eq!(open.max_payload, Some(1_000_000));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn decodes_connect_ack_and_connect_error() {
        assert_eq!(
            EnginePacket::decode(r#"40{"sid":"xyz"}"#).expect("connect"),
            EnginePacket::Message(SocketPacket::Connect {
                namespace: "/".to_string(),
                payload: Some(json!({"sid": "xyz"})),
            })
        );
        assert_eq!(
            EnginePacket::decode(r#"44{"message":"not authorized"}"#).expect("connect error"),
            EnginePacket::Message(SocketPacket::ConnectError {
                namespace: "/".to_string(),
                payload: json!({"message": "not authorized"}),
            })
        );
    }

    #[test]
    fn decodes_translation_event_with_and_without_ack_id() {
        for frame in [
            r#"42["translation_result",{"text":"HELLO"}]"#,
            r#"4217["translation_result",{"text":"HELLO"}]"#,
        ] {
            let EnginePacket::Message(SocketPacket::Event { name, args, .. }) =
                EnginePacket::decode(frame).expect("event")
            else {
                panic!("expected event for {frame}");
            };
            let event = CaptionChannelEvent::from_socket_event(&name, &args)
                .expect("decode")
                .expect("known event");
            assert_eq!(
                event,
                CaptionChannelEvent::TranslationResult(TranslationResult {
                    text: "HELLO".to_string()
                })
            );
        }
    }

    #[test]
    fn event_in_custom_namespace_keeps_namespace() {
        let packet = SocketPacket::decode(r#"2/captions,["translation_result",{"text":"x"}]"#)
            .expect("event");
        assert_eq!(packet.namespace(), "/captions");
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        assert_eq!(
            EnginePacket::decode("2").expect("ping"),
            EnginePacket::Ping(String::new())
        );
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::Pong("probe".to_string()).encode(), "3probe");
    }

    #[test]
    fn encodes_default_namespace_connect_and_disconnect() {
        assert_eq!(
            EnginePacket::Message(SocketPacket::connect_default()).encode(),
            "40"
        );
        assert_eq!(
            EnginePacket::Message(SocketPacket::disconnect_default()).encode(),
            "41"
        );
    }

    #[test]
    fn encoded_event_decodes_to_same_packet() {
        let packet = SocketPacket::Event {
            namespace: "/".to_string(),
            ack_id: None,
            name: TRANSLATION_RESULT_EVENT.to_string(),
            args: vec![json!({"text": "bonjour"})],
        };
        let frame = EnginePacket::Message(packet.clone()).encode();
        assert_eq!(frame, r#"42["translation_result",{"text":"bonjour"}]"#);
        assert_eq!(
            EnginePacket::decode(&frame).expect("decode"),
            EnginePacket::Message(packet)
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(EnginePacket::decode(""), Err(ProtocolError::Empty));
        assert_eq!(
            EnginePacket::decode("9"),
            Err(ProtocolError::UnknownEnginePacket('9'))
        );
        assert!(matches!(
            EnginePacket::decode(r#"42{"text":"no array"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            EnginePacket::decode("42[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            EnginePacket::decode(r#"451-["translation_result",{"_placeholder":true,"num":0}]"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_events_and_bad_payloads() {
        assert_eq!(
            CaptionChannelEvent::from_socket_event("chat", &[json!({"text": "x"})]).expect("ok"),
            None
        );
        assert!(CaptionChannelEvent::from_socket_event(TRANSLATION_RESULT_EVENT, &[]).is_err());
        assert!(CaptionChannelEvent::from_socket_event(
            TRANSLATION_RESULT_EVENT,
            &[json!({"body": "x"})]
        )
        .is_err());
    }
}
