//! Outbound message delivery.

use std::cell::RefCell;

use tokio::sync::mpsc;

use crate::protocol::Message;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Something that carries messages to the peer.
///
/// Inbound messages are not part of this trait: whoever owns the receiving
/// side hands them to [`Session::handle_message`](crate::Session::handle_message)
/// or feeds a channel into [`Session::run`](crate::Session::run).
pub trait Transport {
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Stop sending. Later `send` calls fail with [`TransportError::Closed`].
    fn close(&self);
}

/// In-memory transport over an unbounded tokio channel.
pub struct ChannelTransport {
    tx: RefCell<Option<mpsc::UnboundedSender<Message>>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: RefCell::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let tx = self.tx.borrow();
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.tx.borrow_mut().take().is_some() {
            log::debug!("channel transport closed");
        }
    }
}
