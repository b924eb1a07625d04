//! Events the core reports to the UI, and commands the UI sends back.

use tokio::sync::mpsc;

use crate::types::PeerInfo;

/// Notifications for the UI collaborator.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ChatMessageArrived {
        peer: PeerInfo,
        timestamp: i64,
        text: String,
    },
    ClientConnected(PeerInfo),
    ClientDisconnected {
        peer: PeerInfo,
        reason: String,
    },
    /// `peer` is `None` when no recipient could be resolved.
    SendFailed {
        peer: Option<PeerInfo>,
        text: String,
        reason: String,
    },
    /// Two connections claimed the same identity; `kept` survived.
    DuplicateResolved {
        kept: PeerInfo,
        dropped: PeerInfo,
    },
    ConnectFailed {
        address: String,
        reason: String,
    },
}

/// Requests from the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Broadcast(String),
    Private { username: String, text: String },
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Creates the channel the controller reports on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
