//! A document bound to one peer.
//!
//! Outbound, every local change whose setter id is not this session's own
//! becomes a `PATCH-DOC` message. Inbound patches are applied with the
//! session id as setter id, so they are never sent back.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use vizsync_core::{
    Document, DocumentChangedEvent, SerializeOptions, SetterId, SubscriptionId, SyncError,
};

use crate::pending::{PendingGuard, PendingRequests};
use crate::protocol::{Message, MessageType, ProtocolError, ServerInfo};
use crate::transport::{Transport, TransportError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `request` waits for a correlated reply.
    pub request_timeout: Duration,
    /// Send numeric arrays as side buffers instead of base64 text.
    pub binary_buffers: bool,
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            binary_buffers: true,
            event_channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    fn serialize_options(&self) -> SerializeOptions {
        if self.binary_buffers {
            SerializeOptions::binary()
        } else {
            SerializeOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Terminal.
    Closed,
}

/// Notifications for the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An inbound patch was applied. `skipped` counts parts that were not.
    PatchApplied { applied: usize, skipped: usize },
    /// The peer rejected something we sent.
    RemoteError { text: String },
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer reported an error: {text}")]
    Remote { text: String },
    #[error(transparent)]
    Document(#[from] SyncError),
    #[error("expected {expected} reply, got {actual}")]
    UnexpectedReply {
        expected: MessageType,
        actual: MessageType,
    },
}

struct SessionInner {
    id: SetterId,
    document: Document,
    transport: Rc<dyn Transport>,
    config: SessionConfig,
    state: Cell<ConnectionState>,
    pending: PendingRequests,
    listener: Cell<Option<SubscriptionId>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: RefCell<Option<mpsc::Receiver<SessionEvent>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.document.remove_on_change(listener);
        }
    }
}

/// Cheap-to-clone handle; all clones share one session.
#[derive(Clone)]
pub struct Session(Rc<SessionInner>);

impl Session {
    pub fn new(document: Document, transport: Rc<dyn Transport>, config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let inner = Rc::new(SessionInner {
            id: SetterId::new(),
            document,
            transport,
            config,
            state: Cell::new(ConnectionState::Connected),
            pending: PendingRequests::default(),
            listener: Cell::new(None),
            event_tx,
            event_rx: RefCell::new(Some(event_rx)),
        });

        let weak: Weak<SessionInner> = Rc::downgrade(&inner);
        let listener = inner.document.on_change(move |event| {
            if let Some(inner) = weak.upgrade() {
                Session(inner).forward(event);
            }
        });
        inner.listener.set(Some(listener));

        log::info!("session {} opened", inner.id);
        Session(inner)
    }

    /// Setter id stamped on every change this session applies.
    pub fn id(&self) -> &SetterId {
        &self.0.id
    }

    pub fn document(&self) -> &Document {
        &self.0.document
    }

    pub fn state(&self) -> ConnectionState {
        self.0.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.0.event_rx.borrow_mut().take()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.0.pending.len()
    }

    fn emit(&self, event: SessionEvent) {
        match self.0.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("session {}: event channel full, dropping {event:?}", self.0.id);
            }
            // Nobody is listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.0.transport.send(message)?;
        Ok(())
    }

    fn forward(&self, event: &DocumentChangedEvent) {
        if self.is_closed() || event.setter_id() == Some(&self.0.id) {
            return;
        }
        let options = self.0.config.serialize_options();
        let message = self
            .0
            .document
            .create_patch(std::slice::from_ref(event), options)
            .map_err(SessionError::from)
            .and_then(|(patch, buffers)| {
                if patch.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Message::patch_doc(&patch, buffers)?))
            });
        match message {
            Ok(Some(message)) => {
                if let Err(e) = self.send(message) {
                    log::warn!("session {}: could not send {}: {e}", self.0.id, event.kind());
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("session {}: could not encode {}: {e}", self.0.id, event.kind()),
        }
    }

    /// Process one inbound message.
    ///
    /// Errors are also answered on the wire where the peer is waiting for a
    /// reply; the returned error is for the caller's logs.
    pub fn handle_message(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            log::debug!("session {}: ignoring {} after close", self.0.id, message.msgtype());
            return Err(SessionError::Closed);
        }
        let msgtype = message.msgtype();
        if msgtype.is_reply() {
            return self.handle_reply(message);
        }
        match msgtype {
            MessageType::PatchDoc => self.handle_patch(&message),
            MessageType::ServerInfoReq => {
                self.send(Message::server_info_reply(message.msgid(), &ServerInfo::current())?)
            }
            MessageType::PullDocReq => {
                let (doc, buffers) = self
                    .0
                    .document
                    .to_json_with(self.0.config.serialize_options())?;
                self.send(Message::pull_doc_reply(message.msgid(), doc, buffers)?)?;
                self.0.document.mark_synced();
                Ok(())
            }
            MessageType::PushDoc => {
                let result = message
                    .doc()
                    .map_err(SessionError::from)
                    .and_then(|doc| {
                        self.0
                            .document
                            .replace_with_json(&doc, &message.buffers, Some(&self.0.id))
                            .map_err(SessionError::from)
                    });
                match result {
                    Ok(()) => self.send(Message::ok(message.msgid())),
                    Err(e) => {
                        self.send(Message::error(message.msgid(), e.to_string()))?;
                        Err(e)
                    }
                }
            }
            MessageType::Ack => {
                log::debug!("session {}: ACK", self.0.id);
                Ok(())
            }
            other => {
                log::debug!("session {}: ignoring unsolicited {other}", self.0.id);
                Ok(())
            }
        }
    }

    fn handle_reply(&self, reply: Message) -> Result<(), SessionError> {
        let Err(reply) = self.0.pending.resolve(reply) else {
            return Ok(());
        };
        if reply.msgtype() == MessageType::Error {
            let text = reply.error_text()?;
            log::warn!("session {}: peer error: {text}", self.0.id);
            self.emit(SessionEvent::RemoteError { text });
        } else {
            log::debug!(
                "session {}: dropping late {} for {}",
                self.0.id,
                reply.msgtype(),
                reply.reqid().unwrap_or("<none>")
            );
        }
        Ok(())
    }

    fn handle_patch(&self, message: &Message) -> Result<(), SessionError> {
        let result = message.patch().map_err(SessionError::from).and_then(|patch| {
            self.0
                .document
                .apply_patch(&patch, &message.buffers, Some(&self.0.id))
                .map_err(SessionError::from)
        });
        match result {
            Ok(outcome) => {
                for skipped in &outcome.skipped {
                    log::warn!(
                        "session {}: skipped patch part {:?}: {}",
                        self.0.id,
                        skipped.index,
                        skipped.error
                    );
                }
                self.emit(SessionEvent::PatchApplied {
                    applied: outcome.applied,
                    skipped: outcome.skipped.len(),
                });
                Ok(())
            }
            Err(e) => {
                self.send(Message::error(message.msgid(), e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Send `message` and wait for the reply carrying its id.
    ///
    /// An `ERROR` reply becomes [`SessionError::Remote`]. On timeout, or if
    /// this future is dropped, the pending entry is removed and a late reply
    /// is discarded.
    pub async fn request(&self, message: Message) -> Result<Message, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let inner = &self.0;
        let msgtype = message.msgtype();
        let rx = inner.pending.insert(message.msgid());
        let _guard = PendingGuard::new(&inner.pending, message.msgid());
        inner.transport.send(message)?;

        let timeout = inner.config.request_timeout;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SessionError::Closed),
            Err(_) => {
                log::warn!("session {}: {msgtype} timed out after {timeout:?}", inner.id);
                return Err(SessionError::Timeout(timeout));
            }
        };
        if reply.msgtype() == MessageType::Error {
            return Err(SessionError::Remote {
                text: reply.error_text()?,
            });
        }
        Ok(reply)
    }

    async fn request_expecting(&self, message: Message, expected: MessageType) -> Result<Message, SessionError> {
        let reply = self.request(message).await?;
        if reply.msgtype() != expected {
            return Err(SessionError::UnexpectedReply {
                expected,
                actual: reply.msgtype(),
            });
        }
        Ok(reply)
    }

    /// Round trip to the peer; everything sent before has been processed
    /// once this returns.
    pub async fn force_roundtrip(&self) -> Result<ServerInfo, SessionError> {
        let reply = self
            .request_expecting(Message::server_info_req(), MessageType::ServerInfoReply)
            .await?;
        Ok(reply.server_info()?)
    }

    /// Replace the local contents with the peer's document.
    pub async fn pull(&self) -> Result<(), SessionError> {
        let reply = self
            .request_expecting(Message::pull_doc_req(), MessageType::PullDocReply)
            .await?;
        let doc = reply.doc()?;
        self.0
            .document
            .replace_with_json(&doc, &reply.buffers, Some(&self.0.id))?;
        Ok(())
    }

    /// Replace the peer's contents with the local document.
    pub async fn push(&self) -> Result<(), SessionError> {
        let (doc, buffers) = self
            .0
            .document
            .to_json_with(self.0.config.serialize_options())?;
        self.request_expecting(Message::push_doc(doc, buffers)?, MessageType::Ok)
            .await?;
        self.0.document.mark_synced();
        Ok(())
    }

    /// Handle inbound messages until the channel ends, then close.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle_message(message) {
                log::warn!("session {}: {e}", self.0.id);
            }
            if self.is_closed() {
                break;
            }
        }
        self.handle_close();
    }

    /// Move to `Closed`. Pending requests fail with [`SessionError::Closed`];
    /// the document stays usable but its changes are no longer sent.
    pub fn handle_close(&self) {
        if self.0.state.replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        let failed = self.0.pending.fail_all();
        if let Some(listener) = self.0.listener.take() {
            self.0.document.remove_on_change(listener);
        }
        self.0.transport.close();
        self.emit(SessionEvent::Closed);
        log::info!("session {} closed ({failed} pending requests failed)", self.0.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .field("pending", &self.0.pending.len())
            .finish()
    }
}
