use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const STREAM_EVENT_TYPES: [&str; 5] = ["chunk", "file_change", "agent_update", "error", "complete"];
const HANDSHAKE_TYPE: &str = "connected";

/// A file excerpt attached to a chat request. Order is significant to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub filename: String,
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRequest {
    Connect {
        workspace: String,
    },
    Chat {
        message: String,
        #[serde(default)]
        context: Vec<ContextEntry>,
        workspace: String,
    },
    AgentTask {
        agent: String,
        task: String,
        workspace: String,
    },
}

impl OutboundRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundRequest::Connect { .. } => "connect",
            OutboundRequest::Chat { .. } => "chat",
            OutboundRequest::AgentTask { .. } => "agent_task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
            FileAction::Delete => "delete",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-driven file mutation. `content` is already decoded when
/// `is_base64` was set on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub content: Option<String>,
    pub is_base64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk { text: String },
    FileChange(FileChange),
    AgentUpdate { agent_name: String, status: String },
    Error { message: String },
    Complete,
}

impl StreamEvent {
    /// `Complete` and `Error` end a turn; nothing after them belongs to it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete | StreamEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::FileChange(_) => "file_change",
            StreamEvent::AgentUpdate { .. } => "agent_update",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("unexpected frame type '{found}', expected {expected}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("bad payload encoding: {0}")]
    BadEncoding(String),
    #[error("server refused connection: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame encode failed: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Connected {
        session_id: String,
    },
    Chunk {
        content: String,
    },
    FileChange {
        path: String,
        action: FileAction,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        encoded: Option<bool>,
    },
    AgentUpdate {
        agent: String,
        #[serde(default)]
        status: String,
    },
    Error {
        message: String,
    },
    Complete,
}

pub fn encode(request: &OutboundRequest) -> Result<String, EncodeError> {
    serde_json::to_string(request).map_err(|err| EncodeError(err.to_string()))
}

/// Decodes one inbound frame into a stream event. Pure; never touches I/O.
pub fn decode(frame: &str) -> Result<StreamEvent, DecodeError> {
    match parse_inbound(frame)? {
        InboundFrame::Connected { .. } => Err(DecodeError::UnexpectedType {
            expected: "a stream event",
            found: HANDSHAKE_TYPE.to_string(),
        }),
        InboundFrame::Chunk { content } => Ok(StreamEvent::Chunk { text: content }),
        InboundFrame::FileChange {
            path,
            action,
            content,
            encoded,
        } => {
            if path.trim().is_empty() {
                return Err(DecodeError::Malformed("file_change with empty path".to_string()));
            }
            let is_base64 = encoded.unwrap_or(false);
            let content = match content {
                Some(raw) if is_base64 => Some(decode_base64_text(&raw)?),
                other => other,
            };
            Ok(StreamEvent::FileChange(FileChange {
                path,
                action,
                content,
                is_base64,
            }))
        }
        InboundFrame::AgentUpdate { agent, status } => Ok(StreamEvent::AgentUpdate {
            agent_name: agent,
            status,
        }),
        InboundFrame::Error { message } => Ok(StreamEvent::Error { message }),
        InboundFrame::Complete => Ok(StreamEvent::Complete),
    }
}

/// Validates the acknowledgment that follows `connect` and returns the
/// server-assigned session id.
pub fn decode_handshake(frame: &str) -> Result<String, DecodeError> {
    match parse_inbound(frame)? {
        InboundFrame::Connected { session_id } => Ok(session_id),
        InboundFrame::Error { message } => Err(DecodeError::Refused(message)),
        other => Err(DecodeError::UnexpectedType {
            expected: "connected",
            found: inbound_kind(&other).to_string(),
        }),
    }
}

pub fn decode_base64_text(raw: &str) -> Result<String, DecodeError> {
    let bytes = BASE64_STANDARD
        .decode(raw.trim())
        .map_err(|err| DecodeError::BadEncoding(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| DecodeError::BadEncoding(err.to_string()))
}

pub fn encode_base64_text(text: &str) -> String {
    BASE64_STANDARD.encode(text.as_bytes())
}

fn parse_inbound(frame: &str) -> Result<InboundFrame, DecodeError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::Oversized {
            size: frame.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let value: Value =
        serde_json::from_str(frame).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DecodeError::Malformed("type must be a string".to_string())),
        None => return Err(DecodeError::Malformed("missing type".to_string())),
    };
    if kind != HANDSHAKE_TYPE && !STREAM_EVENT_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|err| DecodeError::Malformed(format!("{kind}: {err}")))
}

fn inbound_kind(frame: &InboundFrame) -> &'static str {
    match frame {
        InboundFrame::Connected { .. } => "connected",
        InboundFrame::Chunk { .. } => "chunk",
        InboundFrame::FileChange { .. } => "file_change",
        InboundFrame::AgentUpdate { .. } => "agent_update",
        InboundFrame::Error { .. } => "error",
        InboundFrame::Complete => "complete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_stream_event_kind() {
        assert_eq!(
            decode(r#"{"type":"chunk","content":"hello "}"#).expect("chunk"),
            StreamEvent::Chunk {
                text: "hello ".to_string()
            }
        );
        assert_eq!(
            decode(r#"{"type":"agent_update","agent":"code_reviewer","status":"reading files"}"#)
                .expect("agent_update"),
            StreamEvent::AgentUpdate {
                agent_name: "code_reviewer".to_string(),
                status: "reading files".to_string(),
            }
        );
        assert_eq!(
            decode(r#"{"type":"error","message":"quota exceeded"}"#).expect("error"),
            StreamEvent::Error {
                message: "quota exceeded".to_string()
            }
        );
        assert_eq!(
            decode(r#"{"type":"complete"}"#).expect("complete"),
            StreamEvent::Complete
        );
    }

    #[test]
    fn bogus_type_is_reported_as_unknown() {
        let err = decode(r#"{"type":"bogus","content":"x"}"#).expect_err("unknown type");
        assert_eq!(err, DecodeError::UnknownType("bogus".to_string()));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let err = decode(r#"{"type":"chunk"}"#).expect_err("missing content");
        assert!(matches!(err, DecodeError::Malformed(_)), "{err:?}");

        let err = decode(r#"{"content":"orphan"}"#).expect_err("missing type");
        assert_eq!(err, DecodeError::Malformed("missing type".to_string()));

        let err = decode("not json").expect_err("garbage");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn file_change_decodes_base64_payload() {
        let frame = format!(
            r#"{{"type":"file_change","path":"src/app.py","action":"update","content":"{}","encoded":true}}"#,
            encode_base64_text("print('hi')\n")
        );
        let event = decode(&frame).expect("file_change");
        assert_eq!(
            event,
            StreamEvent::FileChange(FileChange {
                path: "src/app.py".to_string(),
                action: FileAction::Update,
                content: Some("print('hi')\n".to_string()),
                is_base64: true,
            })
        );
    }

    #[test]
    fn file_change_with_invalid_base64_is_bad_encoding() {
        let err = decode(
            r#"{"type":"file_change","path":"a.txt","action":"create","content":"%%%","encoded":true}"#,
        )
        .expect_err("bad base64");
        assert!(matches!(err, DecodeError::BadEncoding(_)));
    }

    #[test]
    fn delete_without_content_is_valid() {
        let event = decode(r#"{"type":"file_change","path":"old.txt","action":"delete"}"#)
            .expect("delete");
        match event {
            StreamEvent::FileChange(change) => {
                assert_eq!(change.action, FileAction::Delete);
                assert!(change.content.is_none());
                assert!(!change.is_base64);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_file_action_is_malformed() {
        let err = decode(r#"{"type":"file_change","path":"a","action":"rename"}"#)
            .expect_err("bad action");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn handshake_accepts_connected_and_surfaces_refusal() {
        assert_eq!(
            decode_handshake(r#"{"type":"connected","session_id":"sess-42"}"#).expect("ack"),
            "sess-42"
        );
        assert_eq!(
            decode_handshake(r#"{"type":"error","message":"workspace locked"}"#)
                .expect_err("refused"),
            DecodeError::Refused("workspace locked".to_string())
        );
        assert!(matches!(
            decode_handshake(r#"{"type":"chunk","content":"early"}"#),
            Err(DecodeError::UnexpectedType { .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"connected","session_id":"late"}"#),
            Err(DecodeError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn outbound_requests_match_wire_shape() {
        let chat = OutboundRequest::Chat {
            message: "refactor this".to_string(),
            context: vec![
                ContextEntry {
                    filename: "b.py".to_string(),
                    content: "b".to_string(),
                    path: "pkg/b.py".to_string(),
                },
                ContextEntry {
                    filename: "a.py".to_string(),
                    content: "a".to_string(),
                    path: "pkg/a.py".to_string(),
                },
            ],
            workspace: "/work/demo".to_string(),
        };
        let value: Value = serde_json::from_str(&encode(&chat).expect("encode")).expect("json");
        assert_eq!(value["type"], "chat");
        assert_eq!(value["workspace"], "/work/demo");
        assert_eq!(value["context"][0]["filename"], "b.py");
        assert_eq!(value["context"][1]["filename"], "a.py");

        let task = OutboundRequest::AgentTask {
            agent: "debugger".to_string(),
            task: "find the leak".to_string(),
            workspace: "/work/demo".to_string(),
        };
        let value: Value = serde_json::from_str(&encode(&task).expect("encode")).expect("json");
        assert_eq!(value["type"], "agent_task");
        assert_eq!(value["agent"], "debugger");

        let connect = OutboundRequest::Connect {
            workspace: "/work/demo".to_string(),
        };
        assert_eq!(
            encode(&connect).expect("encode"),
            r#"{"type":"connect","workspace":"/work/demo"}"#
        );
    }
}
