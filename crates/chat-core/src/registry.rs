//! The set of connected peers.
//!
//! Locking discipline: the identity map sits behind a `std::sync::Mutex` that
//! is never held across an `.await`. Admission of a new session additionally
//! takes an async gate keyed by `PeerId`, held for the whole add-or-reject
//! decision including the keep-alive probe, so two admissions for one
//! identity are strictly sequential while unrelated identities proceed in
//! parallel.
//!
//! Two nodes that dial each other at the same moment end up with two
//! connections of opposite direction for one identity. When the registry
//! knows this node's listen port, both ends keep the connection opened by the
//! lower identity, so neither side waits on a probe the other has no reader
//! for yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ChatError, Result};
use crate::lock;
use crate::session::PeerSession;
use crate::types::{Direction, PeerId};

/// Outcome of [`PeerRegistry::add_or_reject`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// No session held the identity; the candidate is now registered.
    Accepted,
    /// The existing session answered its probe and stays; the candidate
    /// has been closed.
    Rejected { kept: Arc<PeerSession> },
    /// The existing session failed its probe and has been closed; the
    /// candidate took its place.
    Replaced { evicted: Arc<PeerSession> },
}

impl Admission {
    pub fn is_registered(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Arc<PeerSession>>>,
    gates: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    local_listen_port: Option<u16>,
}

impl PeerRegistry {
    /// A registry that settles every duplicate by probing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry for a node listening on `port`. Crossed connections are
    /// settled by identity order before any probing.
    pub fn with_listen_port(port: u16) -> Self {
        Self {
            local_listen_port: Some(port),
            ..Self::default()
        }
    }

    /// Direction of the connection both ends keep when they dialed each
    /// other: the one opened by the lower identity.
    fn preferred_direction(&self, session: &PeerSession, peer: PeerId) -> Option<Direction> {
        let port = self.local_listen_port?;
        let local = PeerId::new(session.local_addr().ip(), port);
        Some(if local < peer {
            Direction::Outbound
        } else {
            Direction::Inbound
        })
    }

    fn gate(&self, id: PeerId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.gates).entry(id).or_default().clone()
    }

    fn release_gate(&self, id: &PeerId, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = lock(&self.gates);
        drop(gate);
        // the map's own reference is the last one once nobody waits on it
        if gates.get(id).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(id);
        }
    }

    /// Registers a connected session unless a live session already holds its
    /// identity. A held identity is probed with a keep-alive; whichever
    /// session is responsive ends up registered and the other is closed.
    pub async fn add_or_reject(
        &self,
        candidate: Arc<PeerSession>,
        probe_timeout: Duration,
    ) -> Result<Admission> {
        let id = candidate
            .peer_id()
            .ok_or_else(|| ChatError::Handshake("session has no identity yet".into()))?;
        let gate = self.gate(id);
        let admission = {
            let _guard = gate.lock().await;
            self.admit(id, candidate, probe_timeout).await
        };
        self.release_gate(&id, gate);
        admission
    }

    async fn admit(
        &self,
        id: PeerId,
        candidate: Arc<PeerSession>,
        probe_timeout: Duration,
    ) -> Result<Admission> {
        if candidate.is_closed() {
            return Err(ChatError::SessionClosed);
        }
        let existing = lock(&self.peers).get(&id).cloned();
        let Some(existing) = existing else {
            lock(&self.peers).insert(id, candidate);
            info!("Registered peer {id}");
            return Ok(Admission::Accepted);
        };
        if existing.id() == candidate.id() {
            return Ok(Admission::Accepted);
        }

        if existing.direction() != candidate.direction()
            && self.preferred_direction(&candidate, id) == Some(candidate.direction())
        {
            info!(
                "Crossed connections with {id}; keeping {:?} session {}",
                candidate.direction(),
                candidate.id()
            );
            lock(&self.peers).insert(id, candidate);
            existing.close("crossed connection").await;
            return Ok(Admission::Replaced { evicted: existing });
        }

        debug!(
            "Peer {id} already connected as session {}, probing before admitting {}",
            existing.id(),
            candidate.id()
        );
        match existing.probe(probe_timeout).await {
            Ok(()) => {
                info!("Keeping live session {} for {id}; dropping duplicate", existing.id());
                candidate.close("duplicate connection").await;
                Ok(Admission::Rejected { kept: existing })
            }
            Err(e) => {
                info!("Session {} for {id} failed probe ({e}); replacing it", existing.id());
                {
                    let mut peers = lock(&self.peers);
                    peers.insert(id, candidate);
                }
                existing.close("replaced by a newer connection").await;
                Ok(Admission::Replaced { evicted: existing })
            }
        }
    }

    /// Removes whatever session holds `id`.
    pub fn remove(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        let removed = lock(&self.peers).remove(id);
        if removed.is_some() {
            info!("Removed peer {id}");
        }
        removed
    }

    /// Removes `session` only if it is still the one registered under its
    /// identity. Returns whether it was removed.
    pub fn remove_session(&self, session: &PeerSession) -> bool {
        let Some(id) = session.peer_id() else {
            return false;
        };
        let mut peers = lock(&self.peers);
        match peers.get(&id) {
            Some(current) if current.id() == session.id() => {
                peers.remove(&id);
                info!("Removed peer {id}");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        lock(&self.peers).get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        lock(&self.peers).contains_key(id)
    }

    /// First registered session whose handshake carried `username`.
    pub fn find_by_username(&self, username: &str) -> Option<Arc<PeerSession>> {
        lock(&self.peers)
            .values()
            .find(|session| session.username().as_deref() == Some(username))
            .cloned()
    }

    /// Snapshot of all sessions. Later additions and removals do not affect
    /// the returned list.
    pub fn all_peers(&self) -> Vec<Arc<PeerSession>> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Empties the registry and returns what it held.
    pub fn drain(&self) -> Vec<Arc<PeerSession>> {
        lock(&self.peers).drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;
    use crate::session::tests::connected_pair;
    use crate::session::SessionHandler;
    use tokio::sync::watch;

    struct Ignore;

    impl SessionHandler for Ignore {
        fn on_message(&self, _session: &Arc<PeerSession>, _message: Message) {}
        fn on_closed(&self, _session: &Arc<PeerSession>, _reason: &str) {}
    }

    const PROBE: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn test_accept_and_lookup() {
        let registry = PeerRegistry::new();
        let ((session, _rd), _remote) = connected_pair("ann", 4001, "bob", 4002).await;

        let admission = registry.add_or_reject(session.clone(), PROBE).await.unwrap();
        assert!(matches!(admission, Admission::Accepted));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&session.peer_id().unwrap()));
        assert_eq!(registry.find_by_username("bob").unwrap().id(), session.id());
        assert!(registry.find_by_username("carol").is_none());

        // admitting the same session again is a no-op
        let again = registry.add_or_reject(session.clone(), PROBE).await.unwrap();
        assert!(matches!(again, Admission::Accepted));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected_when_existing_answers() {
        let registry = PeerRegistry::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        // both connections lead to a peer listening on 4002
        let ((old, old_rd), (old_remote, old_remote_rd)) =
            connected_pair("ann", 4001, "bob", 4002).await;
        let ((new, _new_rd), _new_remote) = connected_pair("ann", 4001, "bob", 4002).await;
        assert_eq!(old.peer_id(), new.peer_id());

        tokio::spawn(old.clone().run(old_rd, Arc::new(Ignore), stop_rx.clone()));
        tokio::spawn(old_remote.clone().run(old_remote_rd, Arc::new(Ignore), stop_rx));

        registry.add_or_reject(old.clone(), PROBE).await.unwrap();
        let admission = registry.add_or_reject(new.clone(), PROBE).await.unwrap();

        match admission {
            Admission::Rejected { kept } => assert_eq!(kept.id(), old.id()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.len(), 1);
        assert!(new.is_closed());
        assert!(!old.is_closed());
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_duplicate_replaces_unresponsive_existing() {
        let registry = PeerRegistry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        // the old connection's far end never reads, so its probe goes unanswered
        let ((old, old_rd), _old_remote) = connected_pair("ann", 4001, "bob", 4002).await;
        let ((new, _new_rd), _new_remote) = connected_pair("ann", 4001, "bob", 4002).await;
        tokio::spawn(old.clone().run(old_rd, Arc::new(Ignore), stop_rx));

        registry.add_or_reject(old.clone(), PROBE).await.unwrap();
        let admission = registry.add_or_reject(new.clone(), PROBE).await.unwrap();

        match admission {
            Admission::Replaced { evicted } => assert_eq!(evicted.id(), old.id()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.get(&new.peer_id().unwrap()).unwrap().id(), new.id());
        assert!(old.is_closed());

        // the evicted session cleaning up after itself must not remove the new one
        assert!(!registry.remove_session(&old));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_crossed_connections_keep_lower_dialer() {
        // this node listens on 4001, below bob's 4002, so its own dial wins
        let registry = PeerRegistry::with_listen_port(4001);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let (_, (from_bob, _from_bob_rd)) = connected_pair("bob", 4002, "ann", 4001).await;
        let ((to_bob, to_bob_rd), (bob_end, bob_end_rd)) =
            connected_pair("ann", 4001, "bob", 4002).await;
        assert_eq!(from_bob.direction(), Direction::Inbound);
        assert_eq!(from_bob.peer_id(), to_bob.peer_id());

        // nobody reads the inbound stream, so settling it by probe would stall
        registry.add_or_reject(from_bob.clone(), PROBE).await.unwrap();
        let started = tokio::time::Instant::now();
        let admission = registry.add_or_reject(to_bob.clone(), PROBE).await.unwrap();
        assert!(started.elapsed() < PROBE);
        match admission {
            Admission::Replaced { evicted } => assert_eq!(evicted.id(), from_bob.id()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(from_bob.is_closed());

        // the losing direction arriving second is turned away after a probe
        tokio::spawn(to_bob.clone().run(to_bob_rd, Arc::new(Ignore), stop_rx.clone()));
        tokio::spawn(bob_end.clone().run(bob_end_rd, Arc::new(Ignore), stop_rx));
        let (_, (late, _late_rd)) = connected_pair("bob", 4002, "ann", 4001).await;
        match registry.add_or_reject(late.clone(), PROBE).await.unwrap() {
            Admission::Rejected { kept } => assert_eq!(kept.id(), to_bob.id()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(late.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_racing_admissions_register_one() {
        let registry = Arc::new(PeerRegistry::new());
        let ((a, _a_rd), _a_remote) = connected_pair("ann", 4001, "bob", 4002).await;
        let ((b, _b_rd), _b_remote) = connected_pair("ann", 4001, "bob", 4002).await;

        let (ra, rb) = tokio::join!(
            registry.add_or_reject(a.clone(), PROBE),
            registry.add_or_reject(b.clone(), PROBE)
        );
        let registered = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|adm| adm.is_registered())
            .count();
        // neither read loop runs, so the second admission replaces the first
        assert!(registered >= 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(a.is_closed() as u8 + b.is_closed() as u8, 1);
    }

    #[tokio::test]
    async fn test_snapshot_survives_removal() {
        let registry = PeerRegistry::new();
        let ((left, _rd), _remote) = connected_pair("ann", 4001, "bob", 4002).await;
        registry.add_or_reject(left.clone(), PROBE).await.unwrap();

        let snapshot = registry.all_peers();
        registry.remove(&left.peer_id().unwrap());
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }
}
