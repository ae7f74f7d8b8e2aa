//! # bokeh-client — Session layer for Bokeh documents
//!
//! Keeps a local [`bokeh_core::Document`] in sync with a Bokeh server over a
//! websocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  PATCH-DOC / EVENT  ┌─────────────────────┐
//! │ ClientSession │ ──────────────────► │ WebSocketConnection │ ──► server
//! │               │ ◄────────────────── │  writer task        │
//! └───────┬───────┘   incoming msgs     │  reader task        │ ◄── server
//!         │                             │   └─ Receiver       │
//!         ▼                             └─────────────────────┘
//! ┌───────────────┐
//! │ Document      │  local changes ──► on_change ──► PATCH-DOC
//! └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`] — wire messages, headers and message types
//! - [`receiver`] — fragment state machine that reassembles messages
//! - [`session`] — `ClientSession` and the `Connection` contract
//! - [`connection`] — tokio-tungstenite transport and session handshakes

pub mod connection;
pub mod message;
pub mod receiver;
pub mod session;

pub use connection::{
    pull_session, push_session, ClientConfig, ConnectionState, PulledSession,
    WebSocketConnection, PROTOCOL_VERSION,
};
pub use message::{Fragment, Header, Message, MessageType, ProtocolError, Result};
pub use receiver::{Receiver, ReceiverState};
pub use session::{ClientSession, Connection};
