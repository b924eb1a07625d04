//! Orchestrates sessions, the registry and the acceptor for one node.
//!
//! The controller is shared as `Arc<ChatController>`: the acceptor, every
//! session read loop and the UI all call into it concurrently. Mesh growth is
//! gossip driven. Whenever a peer joins, every other peer is told about it
//! and it is told about every other peer, and a node that hears of an
//! unknown peer dials it.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::codec::Message;
use crate::config::NodeConfig;
use crate::error::{ChatError, CodecError, Result};
use crate::events::{ChatEvent, EventSender, UserCommand};
use crate::lock;
use crate::registry::{Admission, PeerRegistry};
use crate::session::{PeerSession, SessionHandler, SessionReader};
use crate::types::{PeerId, PeerInfo};

/// Result of a broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<PeerInfo>,
}

pub struct ChatController {
    me: Weak<ChatController>,
    config: NodeConfig,
    listen_addr: SocketAddr,
    registry: PeerRegistry,
    events: EventSender,
    shutdown: watch::Sender<bool>,
    dialing: Mutex<HashSet<PeerId>>,
    acceptor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatController {
    /// Binds the listen port, starts accepting peers and dials the
    /// configured remote, if any.
    pub async fn start(config: NodeConfig, events: EventSender) -> Result<Arc<Self>> {
        let acceptor = Acceptor::bind(config.listen_port).await?;
        let listen_addr = acceptor.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        let controller = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            listen_addr,
            registry: PeerRegistry::with_listen_port(listen_addr.port()),
            events,
            shutdown,
            dialing: Mutex::new(HashSet::new()),
            acceptor_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&controller);
        let task = tokio::spawn(acceptor.run(
            controller.shutdown.subscribe(),
            move |stream, _addr| {
                if let Some(controller) = weak.upgrade() {
                    controller.accept_inbound(stream);
                }
            },
        ));
        *lock(&controller.acceptor_task) = Some(task);

        info!(
            "{} is up on port {}",
            controller.config.username,
            controller.listen_port()
        );
        if let Some(remote) = controller.config.remote.clone() {
            controller.connect_to(remote.host, remote.port, None);
        }
        Ok(controller)
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr.port()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry
            .all_peers()
            .iter()
            .map(|session| session.info())
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: ChatEvent) {
        // a UI that went away is not a reason to stop serving peers
        let _ = self.events.send(event);
    }

    fn accept_inbound(self: &Arc<Self>, stream: TcpStream) {
        let controller = self.clone();
        tokio::spawn(async move {
            let (session, mut reader) =
                match PeerSession::inbound(stream, controller.config.max_frame_len) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("Dropping inbound stream: {e}");
                        return;
                    }
                };
            let handshake = session
                .handshake(
                    &mut reader,
                    &controller.config.username,
                    controller.listen_port(),
                    controller.config.handshake_timeout(),
                )
                .await;
            if handshake.is_ok() {
                if let Err(e) = controller.admit(session, reader).await {
                    debug!("Inbound peer not admitted: {e}");
                }
            }
        });
    }

    /// Dials a peer in the background. Failures are reported as
    /// [`ChatEvent::ConnectFailed`].
    pub fn connect_to(
        self: &Arc<Self>,
        host: impl Into<String>,
        port: u16,
        expected_username: Option<String>,
    ) {
        let controller = self.clone();
        let host = host.into();
        tokio::spawn(async move {
            if let Err(e) = controller
                .connect_to_now(&host, port, expected_username.as_deref())
                .await
            {
                controller.report_connect_failure(&host, port, &e);
            }
        });
    }

    fn report_connect_failure(&self, host: &str, port: u16, e: &ChatError) {
        warn!("Connection to {host}:{port} failed: {e}");
        self.emit(ChatEvent::ConnectFailed {
            address: format!("{host}:{port}"),
            reason: e.to_string(),
        });
    }

    /// Dials a peer and waits until it is handshaken and admitted. Returns
    /// the session registered for that peer, which is the older one if the
    /// new connection lost duplicate resolution.
    pub async fn connect_to_now(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        expected_username: Option<&str>,
    ) -> Result<PeerInfo> {
        if self.is_stopped() {
            return Err(ChatError::ShutDown);
        }
        let connect_failed = |reason: String| ChatError::ConnectFailed {
            address: format!("{host}:{port}"),
            reason,
        };

        let mut candidates: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| connect_failed(e.to_string()))?
            .collect();
        // the wire format can only advertise IPv4 peers
        candidates.sort_by_key(|addr| !addr.is_ipv4());
        let target = candidates
            .first()
            .copied()
            .ok_or_else(|| connect_failed("address did not resolve".into()))?;

        info!("Connecting to {target}");
        let stream = match timeout(self.config.handshake_timeout(), TcpStream::connect(target)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_failed(e.to_string())),
            Err(_) => return Err(connect_failed("connect timed out".into())),
        };

        let (session, mut reader) =
            PeerSession::outbound(stream, port, self.config.max_frame_len)?;
        let info = session
            .handshake(
                &mut reader,
                &self.config.username,
                self.listen_port(),
                self.config.handshake_timeout(),
            )
            .await?;
        if let Some(expected) = expected_username {
            if info.username.as_deref() != Some(expected) {
                warn!(
                    "Expected {expected} at {target} but {} answered",
                    info.display_name()
                );
            }
        }
        self.admit(session, reader).await
    }

    /// Registers a handshaken session and starts serving it.
    async fn admit(self: &Arc<Self>, session: Arc<PeerSession>, reader: SessionReader) -> Result<PeerInfo> {
        if self.is_stopped() {
            session.close("node shutting down").await;
            return Err(ChatError::ShutDown);
        }

        let admission = self
            .registry
            .add_or_reject(session.clone(), self.config.probe_timeout())
            .await?;
        if self.is_stopped() && admission.is_registered() {
            // shutdown drained the registry while this admission was probing
            self.registry.remove_session(&session);
            session.close("node shutting down").await;
            return Err(ChatError::ShutDown);
        }
        match admission {
            Admission::Accepted => {}
            Admission::Replaced { evicted } => {
                self.emit(ChatEvent::DuplicateResolved {
                    kept: session.info(),
                    dropped: evicted.info(),
                });
            }
            Admission::Rejected { kept } => {
                let kept = kept.info();
                self.emit(ChatEvent::DuplicateResolved {
                    kept: kept.clone(),
                    dropped: session.info(),
                });
                return Ok(kept);
            }
        }

        tokio::spawn(
            session
                .clone()
                .run(reader, self.clone(), self.shutdown.subscribe()),
        );
        if let Some(interval) = self.config.idle_probe_interval() {
            tokio::spawn(
                session
                    .clone()
                    .watch_idle(interval, self.config.probe_timeout()),
            );
        }

        let info = session.info();
        info!("Peer {info} joined");
        self.emit(ChatEvent::ClientConnected(info.clone()));
        self.gossip_join(&session).await;
        Ok(info)
    }

    /// Introduces a newly joined peer and the existing peers to each other.
    async fn gossip_join(&self, joined: &Arc<PeerSession>) {
        let others: Vec<_> = self
            .registry
            .all_peers()
            .into_iter()
            .filter(|peer| peer.id() != joined.id())
            .collect();
        if others.is_empty() {
            return;
        }

        if let Some(about_joined) = client_exchange_for(joined) {
            let sends = others.iter().map(|peer| {
                let message = about_joined.clone();
                async move { (peer, peer.send(&message).await) }
            });
            for (peer, result) in join_all(sends).await {
                if let Err(e) = result {
                    self.drop_unreachable(peer, &e.to_string()).await;
                }
            }
        } else {
            debug!("Cannot advertise {} over IPv4", joined.info());
        }

        for peer in &others {
            let Some(about_peer) = client_exchange_for(peer) else {
                continue;
            };
            if let Err(e) = joined.send(&about_peer).await {
                self.drop_unreachable(joined, &e.to_string()).await;
                break;
            }
        }
    }

    /// Forwards a received chat message to the UI.
    pub fn on_chat_message_arrived(&self, peer: &Arc<PeerSession>, message: Message) {
        let Message::Chat {
            timestamp,
            username,
            text,
        } = message
        else {
            return;
        };
        let info = peer.info();
        if info.username.as_deref() != Some(username.as_str()) {
            debug!("{info} sent a chat signed as {username}");
        }
        self.emit(ChatEvent::ChatMessageArrived {
            peer: info,
            timestamp,
            text,
        });
    }

    /// Dials the advertised peer unless it is already known, already being
    /// dialed, or this node itself.
    pub fn on_client_exchange_arrived(self: &Arc<Self>, peer: &Arc<PeerSession>, message: Message) {
        let Message::ClientExchange {
            address,
            port,
            username,
        } = message
        else {
            return;
        };
        let advertised = PeerId::new(IpAddr::V4(address), port);
        if self.is_self(advertised, peer) {
            debug!("{} advertised this node back to us", peer.info());
            return;
        }
        if self.registry.contains(&advertised) {
            debug!("Already connected to {username}@{advertised}");
            return;
        }
        if !lock(&self.dialing).insert(advertised) {
            return;
        }

        // When two nodes learn of each other at once, the lower identity
        // dials first and the higher one only dials if that never arrives.
        let local = PeerId::new(peer.local_addr().ip(), self.listen_port());
        let delay = if local < advertised {
            Duration::ZERO
        } else {
            let backoff = self.config.gossip_backoff();
            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            backoff + Duration::from_millis(jitter_ms)
        };
        info!("Learned of {username}@{advertised} from {}", peer.info());

        let controller = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !controller.registry.contains(&advertised) && !controller.is_stopped() {
                let host = address.to_string();
                if let Err(e) = controller
                    .connect_to_now(&host, port, Some(&username))
                    .await
                {
                    controller.report_connect_failure(&host, port, &e);
                }
            }
            lock(&controller.dialing).remove(&advertised);
        });
    }

    fn is_self(&self, id: PeerId, via: &PeerSession) -> bool {
        if id.listen_port != self.listen_port() {
            return false;
        }
        let ours = via.local_addr().ip();
        id.address == crate::types::canonical_ip(ours)
            || id.address.is_loopback()
            || id.address == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    async fn drop_unreachable(&self, peer: &Arc<PeerSession>, reason: &str) {
        warn!("Dropping unreachable peer {}: {reason}", peer.info());
        self.registry.remove_session(peer);
        peer.close(&format!("send failed: {reason}")).await;
    }

    /// Refuses a message no peer would accept as one frame.
    fn check_frame_len(&self, message: &Message) -> Result<()> {
        let len = message.length();
        let max = self.config.max_frame_len;
        if len > max {
            return Err(CodecError::FrameTooLarge { len, max }.into());
        }
        Ok(())
    }

    /// Sends `text` to every connected peer. A peer that cannot be written
    /// to is reported, removed and closed; the rest still get the message.
    /// Text too long for one frame goes to nobody and is reported once.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let message = Message::chat(self.config.username.as_str(), text);
        let peers = self.registry.all_peers();
        if let Err(e) = self.check_frame_len(&message) {
            warn!("Not broadcasting: {e}");
            self.emit(ChatEvent::SendFailed {
                peer: None,
                text: text.to_string(),
                reason: e.to_string(),
            });
            return BroadcastReport {
                delivered: 0,
                failed: peers.iter().map(|peer| peer.info()).collect(),
            };
        }
        let sends = peers.iter().map(|peer| {
            let message = &message;
            async move { (peer, peer.send(message).await) }
        });

        let mut report = BroadcastReport::default();
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    let info = peer.info();
                    self.emit(ChatEvent::SendFailed {
                        peer: Some(info.clone()),
                        text: text.to_string(),
                        reason: e.to_string(),
                    });
                    report.failed.push(info);
                    self.drop_unreachable(peer, &e.to_string()).await;
                }
            }
        }
        debug!(
            "Broadcast delivered to {} peers, {} failed",
            report.delivered,
            report.failed.len()
        );
        report
    }

    /// Sends `text` to the peer currently registered under `username`.
    pub async fn send_private(&self, username: &str, text: &str) -> Result<()> {
        let Some(peer) = self.registry.find_by_username(username) else {
            self.emit(ChatEvent::SendFailed {
                peer: None,
                text: text.to_string(),
                reason: format!("recipient {username:?} not found"),
            });
            return Err(ChatError::RecipientNotFound(username.to_string()));
        };

        let message = Message::chat(self.config.username.as_str(), text);
        if let Err(e) = self.check_frame_len(&message) {
            self.emit(ChatEvent::SendFailed {
                peer: Some(peer.info()),
                text: text.to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        if let Err(e) = peer.send(&message).await {
            self.emit(ChatEvent::SendFailed {
                peer: Some(peer.info()),
                text: text.to_string(),
                reason: e.to_string(),
            });
            self.drop_unreachable(&peer, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stops the node: raises the stop flag, says goodbye to every peer,
    /// closes their streams and the listen socket. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Shutting down");
        }

        let peers = self.registry.drain();
        join_all(peers.iter().map(|peer| async move {
            if let Err(e) = peer.send(&Message::Disconnect).await {
                debug!("Could not say goodbye to {}: {e}", peer.info());
            }
            peer.close("local shutdown").await;
        }))
        .await;

        let task = lock(&self.acceptor_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Applies one request from the UI.
    pub async fn handle_command(&self, command: UserCommand) -> Result<()> {
        match command {
            UserCommand::Broadcast(text) => {
                self.broadcast(&text).await;
                Ok(())
            }
            UserCommand::Private { username, text } => self.send_private(&username, &text).await,
            UserCommand::Shutdown => {
                self.shutdown().await;
                Ok(())
            }
        }
    }

    /// Serves UI commands until `Shutdown` arrives or the UI hangs up; either
    /// way the node is shut down on return.
    pub async fn run_commands(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<UserCommand>) {
        while let Some(command) = commands.recv().await {
            let stop = command == UserCommand::Shutdown;
            if let Err(e) = self.handle_command(command).await {
                debug!("Command failed: {e}");
            }
            if stop {
                return;
            }
        }
        self.shutdown().await;
    }
}

impl SessionHandler for ChatController {
    fn on_message(&self, session: &Arc<PeerSession>, message: Message) {
        match message {
            Message::Chat { .. } => self.on_chat_message_arrived(session, message),
            Message::ClientExchange { .. } => {
                if let Some(controller) = self.me.upgrade() {
                    controller.on_client_exchange_arrived(session, message);
                }
            }
            other => debug!("Ignoring {other} from {}", session.info()),
        }
    }

    fn on_closed(&self, session: &Arc<PeerSession>, reason: &str) {
        let removed = self.registry.remove_session(session);
        // an evicted duplicate leaves its replacement behind; the peer is still here
        let replaced = session
            .peer_id()
            .is_some_and(|id| self.registry.contains(&id));
        if !removed && replaced {
            debug!("Superseded session {} closed: {reason}", session.id());
            return;
        }
        self.emit(ChatEvent::ClientDisconnected {
            peer: session.info(),
            reason: reason.to_string(),
        });
    }
}

fn client_exchange_for(session: &PeerSession) -> Option<Message> {
    let id = session.peer_id()?;
    Some(Message::ClientExchange {
        address: id.ipv4()?,
        port: id.listen_port,
        username: session.username().unwrap_or_default(),
    })
}
