//! Chat Core Library
//!
//! This crate provides the core functionality for the P2P chat application:
//! the binary wire codec, peer sessions with handshake and keep-alive, the
//! peer registry with duplicate detection, the connection acceptor and the
//! controller that grows the mesh by gossiping known peers.
//!
//! ```text
//!  TcpListener ──► Acceptor ─┐
//!                            ├─► PeerSession (handshake) ─► PeerRegistry
//!  connect_to ───────────────┘          │                      │
//!                                       ▼                      ▼
//!                              ChatController ◄──── UserCommand (UI)
//!                                       │
//!                                       └────► ChatEvent (UI)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod acceptor;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;
pub mod types;

pub use acceptor::Acceptor;
pub use codec::{Message, MessageKind, PROTOCOL_ID};
pub use config::{NodeConfig, RemotePeer};
pub use controller::{BroadcastReport, ChatController};
pub use error::{ChatError, CodecError, Result};
pub use events::{event_channel, ChatEvent, EventReceiver, EventSender, UserCommand};
pub use registry::{Admission, PeerRegistry};
pub use session::{PeerSession, SessionHandler, SessionReader};
pub use types::*;

/// Locks a std mutex, recovering the data if a holder panicked. None of the
/// guarded state can be left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
