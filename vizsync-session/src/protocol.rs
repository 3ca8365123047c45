//! Protocol messages exchanged between two sessions.
//!
//! A message is four parts: a header, free-form metadata, a typed content
//! object and zero or more binary buffers. On the wire it travels as a
//! sequence of fragments:
//!
//! ```text
//! ┌────────┬──────────┬─────────┬───────────────┬────────────────┬─────┐
//! │ header │ metadata │ content │ buffer header │ buffer payload │ ... │
//! │ text   │ text     │ text    │ text {"id"}   │ binary         │     │
//! └────────┴──────────┴─────────┴───────────────┴────────────────┴─────┘
//! ```
//!
//! The buffer pair repeats `header.num_buffers` times.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use vizsync_core::codec::BufferHeader;
use vizsync_core::{Buffer, DocumentJson, Patch};

/// Message kinds understood by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "PATCH-DOC")]
    PatchDoc,
    #[serde(rename = "PULL-DOC-REQ")]
    PullDocReq,
    #[serde(rename = "PULL-DOC-REPLY")]
    PullDocReply,
    #[serde(rename = "PUSH-DOC")]
    PushDoc,
    #[serde(rename = "SERVER-INFO-REQ")]
    ServerInfoReq,
    #[serde(rename = "SERVER-INFO-REPLY")]
    ServerInfoReply,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Ack => "ACK",
            MessageType::Ok => "OK",
            MessageType::Error => "ERROR",
            MessageType::PatchDoc => "PATCH-DOC",
            MessageType::PullDocReq => "PULL-DOC-REQ",
            MessageType::PullDocReply => "PULL-DOC-REPLY",
            MessageType::PushDoc => "PUSH-DOC",
            MessageType::ServerInfoReq => "SERVER-INFO-REQ",
            MessageType::ServerInfoReply => "SERVER-INFO-REPLY",
        }
    }

    /// Whether this kind answers an earlier request.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::Ok
                | MessageType::Error
                | MessageType::PullDocReply
                | MessageType::ServerInfoReply
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

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

impl Header {
    fn new(msgtype: MessageType) -> Self {
        Self {
            msgid: Uuid::new_v4().to_string(),
            msgtype,
            reqid: None,
            num_buffers: None,
        }
    }

    pub fn expected_buffers(&self) -> usize {
        self.num_buffers.unwrap_or(0)
    }
}

/// Version information returned by `SERVER-INFO-REPLY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version_info: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub vizsync: String,
    pub protocol: String,
}

impl ServerInfo {
    pub fn current() -> Self {
        Self {
            version_info: VersionInfo {
                vizsync: vizsync_core::document::VERSION.to_string(),
                protocol: "1.0".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocContent {
    doc: DocumentJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorContent {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
}

/// Protocol decoding errors.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("invalid JSON in {part}: {source}")]
    Json {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("expected a {expected} fragment")]
    UnexpectedFragment { expected: &'static str },
    #[error("expected {expected} content, got {actual}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// One frame of a message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Binary(Vec<u8>),
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub metadata: JsonValue,
    pub content: JsonValue,
    pub buffers: Vec<Buffer>,
}

impl Message {
    fn new(msgtype: MessageType, content: JsonValue) -> Self {
        Self {
            header: Header::new(msgtype),
            metadata: json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    fn reply_to(mut self, reqid: &str) -> Self {
        self.header.reqid = Some(reqid.to_string());
        self
    }

    fn with_buffers(mut self, buffers: Vec<Buffer>) -> Self {
        self.header.num_buffers = (!buffers.is_empty()).then_some(buffers.len());
        self.buffers = buffers;
        self
    }

    fn to_content<T: Serialize>(value: &T) -> Result<JsonValue, ProtocolError> {
        serde_json::to_value(value).map_err(|source| ProtocolError::Json { part: "content", source })
    }

    pub fn ack() -> Self {
        Self::new(MessageType::Ack, json!({}))
    }

    pub fn ok(reqid: &str) -> Self {
        Self::new(MessageType::Ok, json!({})).reply_to(reqid)
    }

    pub fn error(reqid: &str, text: impl Into<String>) -> Self {
        let content = json!({ "text": text.into() });
        Self::new(MessageType::Error, content).reply_to(reqid)
    }

    pub fn patch_doc(patch: &Patch, buffers: Vec<Buffer>) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PatchDoc, Self::to_content(patch)?).with_buffers(buffers))
    }

    pub fn pull_doc_req() -> Self {
        Self::new(MessageType::PullDocReq, json!({}))
    }

    pub fn pull_doc_reply(reqid: &str, doc: DocumentJson, buffers: Vec<Buffer>) -> Result<Self, ProtocolError> {
        let content = Self::to_content(&DocContent { doc })?;
        Ok(Self::new(MessageType::PullDocReply, content)
            .reply_to(reqid)
            .with_buffers(buffers))
    }

    pub fn push_doc(doc: DocumentJson, buffers: Vec<Buffer>) -> Result<Self, ProtocolError> {
        let content = Self::to_content(&DocContent { doc })?;
        Ok(Self::new(MessageType::PushDoc, content).with_buffers(buffers))
    }

    pub fn server_info_req() -> Self {
        Self::new(MessageType::ServerInfoReq, json!({}))
    }

    pub fn server_info_reply(reqid: &str, info: &ServerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::ServerInfoReply, Self::to_content(info)?).reply_to(reqid))
    }

    pub fn msgid(&self) -> &str {
        &self.header.msgid
    }

    pub fn msgtype(&self) -> MessageType {
        self.header.msgtype
    }

    pub fn reqid(&self) -> Option<&str> {
        self.header.reqid.as_deref()
    }

    fn ensure_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.header.msgtype == expected {
            Ok(())
        } else {
            Err(ProtocolError::WrongType {
                expected,
                actual: self.header.msgtype,
            })
        }
    }

    fn content_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone())
            .map_err(|source| ProtocolError::Json { part: "content", source })
    }

    pub fn patch(&self) -> Result<Patch, ProtocolError> {
        self.ensure_type(MessageType::PatchDoc)?;
        self.content_as()
    }

    /// The document carried by `PULL-DOC-REPLY` or `PUSH-DOC`.
    pub fn doc(&self) -> Result<DocumentJson, ProtocolError> {
        if self.header.msgtype != MessageType::PushDoc {
            self.ensure_type(MessageType::PullDocReply)?;
        }
        Ok(self.content_as::<DocContent>()?.doc)
    }

    pub fn server_info(&self) -> Result<ServerInfo, ProtocolError> {
        self.ensure_type(MessageType::ServerInfoReply)?;
        self.content_as()
    }

    pub fn error_text(&self) -> Result<String, ProtocolError> {
        self.ensure_type(MessageType::Error)?;
        let content: ErrorContent = self.content_as()?;
        Ok(match content.traceback {
            Some(traceback) => format!("{}\n{traceback}", content.text),
            None => content.text,
        })
    }

    /// Split into wire fragments in send order.
    pub fn to_fragments(&self) -> Result<Vec<Fragment>, ProtocolError> {
        fn text<T: Serialize>(part: &'static str, value: &T) -> Result<Fragment, ProtocolError> {
            serde_json::to_string(value)
                .map(Fragment::Text)
                .map_err(|source| ProtocolError::Json { part, source })
        }
        let mut fragments = Vec::with_capacity(3 + 2 * self.buffers.len());
        fragments.push(text("header", &self.header)?);
        fragments.push(text("metadata", &self.metadata)?);
        fragments.push(text("content", &self.content)?);
        for buffer in &self.buffers {
            let header = BufferHeader { id: buffer.id.clone() };
            fragments.push(text("buffer header", &header)?);
            fragments.push(Fragment::Binary(buffer.data.clone()));
        }
        Ok(fragments)
    }
}
