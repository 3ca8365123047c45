//! # vizsync-session: keeps a document in step with one peer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   PATCH-DOC / requests    ┌─────────────┐
//! │  Session A  │ ────────────────────────► │  Session B  │
//! │             │ ◄──────────────────────── │             │
//! └──────┬──────┘   replies (reqid)         └──────┬──────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────┐                           ┌─────────────┐
//! │ Document A  │                           │ Document B  │
//! └─────────────┘                           └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message types, headers and wire fragments
//! - [`receiver`]: fragment reassembly
//! - [`transport`]: the outbound [`Transport`] trait and an in-memory channel
//! - [`session`]: change forwarding, request correlation, peer replies
//!
//! A session is `!Send`; drive it on a current-thread runtime or a
//! `LocalSet`.

mod pending;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod transport;

pub use protocol::{Fragment, Header, Message, MessageType, ProtocolError, ServerInfo, VersionInfo};
pub use receiver::MessageReceiver;
pub use session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};
pub use transport::{ChannelTransport, Transport, TransportError};
