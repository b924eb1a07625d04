//! Core types for the P2P chat application

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a remote node: the address it connects from plus the port it
/// listens on. Usernames are not part of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub address: IpAddr,
    pub listen_port: u16,
}

impl PeerId {
    pub fn new(address: IpAddr, listen_port: u16) -> Self {
        Self {
            address: canonical_ip(address),
            listen_port,
        }
    }

    /// The IPv4 form of this identity, if it has one. Only IPv4 peers can be
    /// advertised in a client exchange.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.listen_port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.listen_port),
        }
    }
}

/// Unmaps IPv4-mapped IPv6 addresses so a peer seen over a dual-stack socket
/// and the same peer seen over IPv4 share one identity.
pub fn canonical_ip(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(address),
        v4 => v4,
    }
}

/// Unique per connection, so a session never removes a replacement that took
/// over its `PeerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the first group is plenty to tell sessions apart in logs
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// Connection lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of a peer handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub username: Option<String>,
    pub direction: Direction,
}

impl PeerInfo {
    /// Username for display, falling back to the address.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.peer_id.to_string())
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(name) => write!(f, "{}@{}", name, self.peer_id),
            None => write!(f, "{}", self.peer_id),
        }
    }
}
