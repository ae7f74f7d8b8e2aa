//! Wire messages.
//!
//! A message travels as an ordered sequence of websocket frames:
//! ```text
//! ┌────────┬──────────┬─────────┬───────────────┬────────────────┬ ─ ─ ─
//! │ header │ metadata │ content │ buffer header │ buffer payload │ ...
//! │ text   │ text     │ text    │ text          │ binary         │
//! └────────┴──────────┴─────────┴───────────────┴────────────────┴ ─ ─ ─
//! ```
//! The header declares `num_buffers`; a message is complete once that many
//! buffer pairs have arrived.

use std::fmt;

use bokeh_core::{Buffer, DocJson, Patch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use uuid::Uuid;

/// One websocket frame of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Binary(Vec<u8>),
}

/// Message types spoken by the server protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Ack,
    Ok,
    Error,
    Event,
    PatchDoc,
    PullDocReq,
    PullDocReply,
    PushDoc,
    ServerInfoReq,
    ServerInfoReply,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ack => "ACK",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Event => "EVENT",
            Self::PatchDoc => "PATCH-DOC",
            Self::PullDocReq => "PULL-DOC-REQ",
            Self::PullDocReply => "PULL-DOC-REPLY",
            Self::PushDoc => "PUSH-DOC",
            Self::ServerInfoReq => "SERVER-INFO-REQ",
            Self::ServerInfoReply => "SERVER-INFO-REPLY",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "ACK" => Self::Ack,
            "OK" => Self::Ok,
            "ERROR" => Self::Error,
            "EVENT" => Self::Event,
            "PATCH-DOC" => Self::PatchDoc,
            "PULL-DOC-REQ" => Self::PullDocReq,
            "PULL-DOC-REPLY" => Self::PullDocReply,
            "PUSH-DOC" => Self::PushDoc,
            "SERVER-INFO-REQ" => Self::ServerInfoReq,
            "SERVER-INFO-REPLY" => Self::ServerInfoReply,
            _ => Self::Other(name),
        }
    }
}

impl From<MessageType> for String {
    fn from(msgtype: MessageType) -> Self {
        msgtype.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first fragment of every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msgid: String,
    pub msgtype: MessageType,
    /// Id of the request this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_buffers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub metadata: Json,
    pub content: Json,
    pub buffers: Vec<Buffer>,
}

impl Message {
    /// A new message with a fresh `msgid`.
    pub fn create(msgtype: MessageType, metadata: Json, content: Json) -> Self {
        Self {
            header: Header {
                msgid: Uuid::new_v4().to_string(),
                msgtype,
                reqid: None,
                num_buffers: None,
            },
            metadata,
            content,
            buffers: Vec::new(),
        }
    }

    /// Mark this message as the answer to request `reqid`.
    pub fn in_reply_to(mut self, reqid: impl Into<String>) -> Self {
        self.header.reqid = Some(reqid.into());
        self
    }

    /// Build a message from its three text fragments.
    pub fn assemble(header: &str, metadata: &str, content: &str) -> Result<Self> {
        Ok(Self {
            header: serde_json::from_str(header)?,
            metadata: serde_json::from_str(metadata)?,
            content: serde_json::from_str(content)?,
            buffers: Vec::new(),
        })
    }

    /// Attach a buffer received off the wire.
    pub fn assemble_buffer(&mut self, buf_header: &str, payload: Vec<u8>) -> Result<()> {
        let expected = self.header.num_buffers.unwrap_or(0);
        if expected <= self.buffers.len() {
            return Err(ProtocolError::TooManyBuffers(expected));
        }
        self.buffers.push(Buffer {
            header: serde_json::from_str(buf_header)?,
            data: payload,
        });
        Ok(())
    }

    /// Attach an outgoing buffer and bump `num_buffers`.
    pub fn add_buffer(&mut self, buffer: Buffer) {
        self.header.num_buffers = Some(self.header.num_buffers.unwrap_or(0) + 1);
        self.buffers.push(buffer);
    }

    pub fn complete(&self) -> bool {
        self.header.num_buffers.unwrap_or(0) == self.buffers.len()
    }

    /// The frames to write, in order.
    pub fn fragments(&self) -> Result<Vec<Fragment>> {
        let mut fragments = Vec::with_capacity(3 + 2 * self.buffers.len());
        fragments.push(Fragment::Text(serde_json::to_string(&self.header)?));
        fragments.push(Fragment::Text(serde_json::to_string(&self.metadata)?));
        fragments.push(Fragment::Text(serde_json::to_string(&self.content)?));
        for buffer in &self.buffers {
            fragments.push(Fragment::Text(serde_json::to_string(&buffer.header)?));
            fragments.push(Fragment::Binary(buffer.data.clone()));
        }
        Ok(fragments)
    }

    pub fn msgid(&self) -> &str {
        &self.header.msgid
    }

    pub fn msgtype(&self) -> &MessageType {
        &self.header.msgtype
    }

    pub fn reqid(&self) -> Option<&str> {
        self.header.reqid.as_deref()
    }

    /// Text of an `ERROR` message.
    pub fn error_text(&self) -> Option<&str> {
        self.content.get("text").and_then(Json::as_str)
    }

    // -- Constructors for specific message types --

    pub fn ack() -> Self {
        Self::create(MessageType::Ack, json!({}), json!({}))
    }

    pub fn ok(reqid: &str) -> Self {
        Self::create(MessageType::Ok, json!({}), json!({})).in_reply_to(reqid)
    }

    pub fn error(reqid: &str, text: impl Into<String>) -> Self {
        let content = json!({ "text": text.into(), "traceback": null });
        Self::create(MessageType::Error, json!({}), content).in_reply_to(reqid)
    }

    pub fn patch_doc(patch: &Patch, buffers: Vec<Buffer>) -> Result<Self> {
        let mut message = Self::create(MessageType::PatchDoc, json!({}), patch.to_json()?);
        for buffer in buffers {
            message.add_buffer(buffer);
        }
        Ok(message)
    }

    pub fn event(content: Json) -> Self {
        Self::create(MessageType::Event, json!({}), content)
    }

    pub fn server_info_req() -> Self {
        Self::create(MessageType::ServerInfoReq, json!({}), json!({}))
    }

    pub fn server_info_reply(reqid: &str) -> Self {
        let content = json!({
            "version_info": {
                "bokeh": bokeh_core::VERSION,
                "server": bokeh_core::VERSION,
            }
        });
        Self::create(MessageType::ServerInfoReply, json!({}), content).in_reply_to(reqid)
    }

    pub fn pull_doc_req() -> Self {
        Self::create(MessageType::PullDocReq, json!({}), json!({}))
    }

    pub fn pull_doc_reply(reqid: &str, doc: &DocJson) -> Result<Self> {
        let content = json!({ "doc": serde_json::to_value(doc)? });
        Ok(Self::create(MessageType::PullDocReply, json!({}), content).in_reply_to(reqid))
    }

    pub fn push_doc(doc: &DocJson) -> Result<Self> {
        let content = json!({ "doc": serde_json::to_value(doc)? });
        Ok(Self::create(MessageType::PushDoc, json!({}), content))
    }

    /// The document carried by a `PULL-DOC-REPLY` or `PUSH-DOC`.
    pub fn doc(&self) -> Result<DocJson> {
        let doc = self
            .content
            .get("doc")
            .ok_or_else(|| ProtocolError::UnexpectedMessage(self.header.msgtype.to_string()))?;
        Ok(serde_json::from_value(doc.clone())?)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Core(#[from] bokeh_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected text fragment but received binary")]
    ExpectedText,

    #[error("Expected binary fragment but received text")]
    ExpectedBinary,

    #[error("too many buffers received expecting {0}")]
    TooManyBuffers(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgtype_names() {
        for name in [
            "ACK",
            "OK",
            "ERROR",
            "EVENT",
            "PATCH-DOC",
            "PULL-DOC-REQ",
            "PULL-DOC-REPLY",
            "PUSH-DOC",
            "SERVER-INFO-REQ",
            "SERVER-INFO-REPLY",
        ] {
            let msgtype = MessageType::from(name.to_string());
            assert!(!matches!(msgtype, MessageType::Other(_)), "{name}");
            assert_eq!(msgtype.as_str(), name);
        }
        assert_eq!(
            MessageType::from("SHUTDOWN".to_string()),
            MessageType::Other("SHUTDOWN".to_string())
        );
    }

    #[test]
    fn test_header_json() {
        let msg = Message::ok("req-1");
        let header: Json = serde_json::to_value(&msg.header).unwrap();
        assert_eq!(header["msgtype"], "OK");
        assert_eq!(header["reqid"], "req-1");
        assert!(header.get("num_buffers").is_none());
    }

    #[test]
    fn test_assemble() {
        let msg = Message::assemble(
            r#"{"msgid": "1", "msgtype": "PATCH-DOC", "num_buffers": 1}"#,
            "{}",
            r#"{"events": []}"#,
        )
        .unwrap();
        assert_eq!(msg.msgtype(), &MessageType::PatchDoc);
        assert!(!msg.complete());
    }

    #[test]
    fn test_assemble_bad_json() {
        let err = Message::assemble("{", "{}", "{}").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_too_many_buffers() {
        let header = r#"{"msgid": "1", "msgtype": "PATCH-DOC", "num_buffers": 1}"#;
        let mut msg = Message::assemble(header, "{}", "{}").unwrap();
        msg.assemble_buffer(r#"{"id": "a"}"#, vec![1, 2]).unwrap();
        assert!(msg.complete());
        let err = msg.assemble_buffer(r#"{"id": "b"}"#, vec![3]).unwrap_err();
        assert_eq!(err.to_string(), "too many buffers received expecting 1");
    }

    #[test]
    fn test_add_buffer_and_fragments() {
        let mut msg = Message::event(json!({"event_name": "tap"}));
        msg.add_buffer(Buffer::new("b1", vec![9, 9]));
        msg.add_buffer(Buffer::new("b2", vec![7]));
        assert_eq!(msg.header.num_buffers, Some(2));
        assert!(msg.complete());

        let fragments = msg.fragments().unwrap();
        assert_eq!(fragments.len(), 7);
        assert!(matches!(&fragments[3], Fragment::Text(t) if t.contains("b1")));
        assert_eq!(fragments[4], Fragment::Binary(vec![9, 9]));
        assert_eq!(fragments[6], Fragment::Binary(vec![7]));
    }

    #[test]
    fn test_error_message() {
        let msg = Message::error("r", "boom");
        assert_eq!(msg.error_text(), Some("boom"));
        assert_eq!(msg.reqid(), Some("r"));
    }

    #[test]
    fn test_doc_missing() {
        let err = Message::pull_doc_req().doc().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage(t) if t == "PULL-DOC-REQ"));
    }
}
