//! Reassembles wire fragments into [`Message`]s.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use vizsync_core::codec::BufferHeader;
use vizsync_core::Buffer;

use crate::protocol::{Fragment, Header, Message, ProtocolError};

struct Partial {
    header: Header,
    metadata: JsonValue,
    content: JsonValue,
    buffers: Vec<Buffer>,
}

impl Partial {
    fn finish(self) -> Message {
        Message {
            header: self.header,
            metadata: self.metadata,
            content: self.content,
            buffers: self.buffers,
        }
    }

    fn is_complete(&self) -> bool {
        self.buffers.len() >= self.header.expected_buffers()
    }
}

#[derive(Default)]
enum Stage {
    #[default]
    Header,
    Metadata(Header),
    Content(Header, JsonValue),
    BufferHeader(Partial),
    BufferPayload(Partial, String),
}

/// Fragment state machine.
///
/// Feed fragments in arrival order with [`consume`](Self::consume); a
/// complete message is returned once its last fragment arrives. Any error
/// discards the partial message and resets the receiver.
#[derive(Default)]
pub struct MessageReceiver {
    stage: Stage,
}

fn parse<T: DeserializeOwned>(part: &'static str, text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|source| ProtocolError::Json { part, source })
}

impl MessageReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Header)
    }

    pub fn consume(&mut self, fragment: Fragment) -> Result<Option<Message>, ProtocolError> {
        let stage = std::mem::take(&mut self.stage);
        let (next, done) = Self::step(stage, fragment)?;
        self.stage = next;
        Ok(done)
    }

    fn step(stage: Stage, fragment: Fragment) -> Result<(Stage, Option<Message>), ProtocolError> {
        match (stage, fragment) {
            (Stage::Header, Fragment::Text(text)) => {
                let header: Header = parse("header", &text)?;
                Ok((Stage::Metadata(header), None))
            }
            (Stage::Metadata(header), Fragment::Text(text)) => {
                let metadata = parse("metadata", &text)?;
                Ok((Stage::Content(header, metadata), None))
            }
            (Stage::Content(header, metadata), Fragment::Text(text)) => {
                let partial = Partial {
                    buffers: Vec::new(),
                    content: parse("content", &text)?,
                    header,
                    metadata,
                };
                Ok(Self::advance(partial))
            }
            (Stage::BufferHeader(partial), Fragment::Text(text)) => {
                let BufferHeader { id } = parse("buffer header", &text)?;
                Ok((Stage::BufferPayload(partial, id), None))
            }
            (Stage::BufferPayload(mut partial, id), Fragment::Binary(data)) => {
                partial.buffers.push(Buffer { id, data });
                Ok(Self::advance(partial))
            }
            (Stage::BufferPayload(..), Fragment::Text(_)) => {
                Err(ProtocolError::UnexpectedFragment { expected: "binary" })
            }
            (_, Fragment::Binary(_)) => Err(ProtocolError::UnexpectedFragment { expected: "text" }),
        }
    }

    fn advance(partial: Partial) -> (Stage, Option<Message>) {
        if partial.is_complete() {
            (Stage::Header, Some(partial.finish()))
        } else {
            (Stage::BufferHeader(partial), None)
        }
    }
}
