//! One connection to one remote peer.
//!
//! A session is split in two: the shared [`PeerSession`] (state, identity and
//! the write half behind a mutex) and the [`SessionReader`] owned by whichever
//! task is reading. The handshake runs on the reader first; afterwards
//! [`PeerSession::run`] consumes it for the read loop.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{self, Message};
use crate::error::{ChatError, CodecError, Result};
use crate::lock;
use crate::types::{Direction, PeerId, PeerInfo, SessionId, SessionState};

/// Upper bound on a single frame write before the peer is considered stuck.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives what a connected session reads.
///
/// Both callbacks run on the session's read task, so they must not block.
pub trait SessionHandler: Send + Sync + 'static {
    /// A `Chat` or `ClientExchange` arrived. Keep-alives, disconnects and
    /// stray handshakes are handled by the session itself.
    fn on_message(&self, session: &Arc<PeerSession>, message: Message);

    /// The read loop ended and the stream is closed.
    fn on_closed(&self, session: &Arc<PeerSession>, reason: &str);
}

/// Read half of a session's stream.
pub struct SessionReader {
    inner: BufReader<OwnedReadHalf>,
    max_frame_len: u32,
}

impl SessionReader {
    pub async fn read(&mut self) -> std::result::Result<Message, CodecError> {
        codec::read_message(&mut self.inner, self.max_frame_len).await
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    username: Option<String>,
    listen_port: Option<u16>,
    close_reason: Option<String>,
}

pub struct PeerSession {
    id: SessionId,
    direction: Direction,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    inner: Mutex<SessionInner>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    probes: Mutex<Vec<oneshot::Sender<()>>>,
    last_seen: Mutex<Instant>,
    max_frame_len: u32,
}

impl PeerSession {
    /// Wraps a stream accepted from a remote peer. Its listen port is only
    /// known once the handshake arrives.
    pub fn inbound(stream: TcpStream, max_frame_len: u32) -> io::Result<(Arc<Self>, SessionReader)> {
        Self::from_stream(stream, Direction::Inbound, None, max_frame_len)
    }

    /// Wraps a stream this node opened to `port`.
    pub fn outbound(
        stream: TcpStream,
        port: u16,
        max_frame_len: u32,
    ) -> io::Result<(Arc<Self>, SessionReader)> {
        Self::from_stream(stream, Direction::Outbound, Some(port), max_frame_len)
    }

    fn from_stream(
        stream: TcpStream,
        direction: Direction,
        listen_port: Option<u16>,
        max_frame_len: u32,
    ) -> io::Result<(Arc<Self>, SessionReader)> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {remote_addr}: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);

        let session = Arc::new(Self {
            id: SessionId::new(),
            direction,
            remote_addr,
            local_addr,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                username: None,
                listen_port,
                close_reason: None,
            }),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            closed,
            probes: Mutex::new(Vec::new()),
            last_seen: Mutex::new(Instant::now()),
            max_frame_len,
        });
        let reader = SessionReader {
            inner: BufReader::new(read_half),
            max_frame_len,
        };
        debug!(session = %session.id, "New {:?} stream with {remote_addr}", direction);
        Ok((session, reader))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn username(&self) -> Option<String> {
        lock(&self.inner).username.clone()
    }

    /// `None` until the listen port is known.
    pub fn peer_id(&self) -> Option<PeerId> {
        lock(&self.inner)
            .listen_port
            .map(|port| PeerId::new(self.remote_addr.ip(), port))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.inner).close_reason.clone()
    }

    /// Time since anything was last read from the peer.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    pub fn info(&self) -> PeerInfo {
        let inner = lock(&self.inner);
        let port = inner.listen_port.unwrap_or_else(|| self.remote_addr.port());
        PeerInfo {
            session_id: self.id,
            peer_id: PeerId::new(self.remote_addr.ip(), port),
            username: inner.username.clone(),
            direction: self.direction,
        }
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Exchanges handshakes. On success the session is `Connected`; on any
    /// failure it is closed before the error is returned.
    pub async fn handshake(
        &self,
        reader: &mut SessionReader,
        local_username: &str,
        local_listen_port: u16,
        wait: Duration,
    ) -> Result<PeerInfo> {
        lock(&self.inner).state = SessionState::Handshaking;

        let exchange = self.exchange_handshakes(reader, local_username, local_listen_port);
        let outcome = match timeout(wait, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChatError::Handshake(format!("no handshake within {wait:?}"))),
        };

        match outcome {
            Ok((username, listen_port)) => {
                {
                    let mut inner = lock(&self.inner);
                    if inner.state == SessionState::Disconnected {
                        return Err(ChatError::SessionClosed);
                    }
                    match inner.listen_port {
                        Some(dialed) if dialed != listen_port => warn!(
                            session = %self.id,
                            "{} announced listen port {} but was dialed on {}",
                            username, listen_port, dialed
                        ),
                        Some(_) => {}
                        None => inner.listen_port = Some(listen_port),
                    }
                    inner.username = Some(username);
                    inner.state = SessionState::Connected;
                }
                self.touch();
                let info = self.info();
                info!(session = %self.id, "Handshake complete with {info}");
                Ok(info)
            }
            Err(e) => {
                warn!(session = %self.id, "Handshake with {} failed: {e}", self.remote_addr);
                self.close(&format!("handshake failed: {e}")).await;
                Err(e)
            }
        }
    }

    async fn exchange_handshakes(
        &self,
        reader: &mut SessionReader,
        local_username: &str,
        local_listen_port: u16,
    ) -> Result<(String, u16)> {
        self.send(&Message::Handshake {
            username: local_username.to_string(),
            listen_port: local_listen_port,
        })
        .await?;
        match reader.read().await {
            Ok(Message::Handshake {
                username,
                listen_port,
            }) => Ok((username, listen_port)),
            Ok(other) => Err(ChatError::Handshake(format!(
                "expected Handshake, received {}",
                other.kind().name()
            ))),
            Err(CodecError::ProtocolMismatch(id)) => Err(ChatError::Handshake(format!(
                "unsupported protocol identifier {id:?}"
            ))),
            Err(e) => Err(ChatError::Codec(e)),
        }
    }

    /// Writes one whole frame. Concurrent callers are serialized, so frames
    /// never interleave on the wire. A message longer than the frame limit is
    /// refused without touching the stream.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let length = message.length();
        if length > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: length,
                max: self.max_frame_len,
            }
            .into());
        }
        let frame = codec::encode(message);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChatError::SessionClosed)?;

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                debug!(session = %self.id, "Sent {message}");
                Ok(())
            }
            Ok(Err(e)) => Err(ChatError::Io(e)),
            Err(_) => Err(ChatError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    /// Sends a keep-alive and waits for the peer's keep-alive in return.
    ///
    /// Concurrent probes share one outstanding keep-alive. The reply is
    /// picked up by the read loop, so this only succeeds on a session whose
    /// read loop is running.
    pub async fn probe(&self, wait: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut probes = lock(&self.probes);
            if self.is_closed() {
                return Err(ChatError::SessionClosed);
            }
            probes.retain(|p| !p.is_closed());
            probes.push(tx);
            probes.len() == 1
        };
        if first {
            if let Err(e) = self.send(&Message::KeepAlive).await {
                lock(&self.probes).clear();
                return Err(e);
            }
        }

        let outcome = match timeout(wait, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChatError::SessionClosed),
            Err(_) => Err(ChatError::ProbeTimeout),
        };
        lock(&self.probes).retain(|p| !p.is_closed());
        outcome
    }

    /// A received keep-alive answers our probes if any are waiting; otherwise
    /// it is the peer probing us and gets one keep-alive back.
    async fn on_keep_alive(&self) {
        let waiting: Vec<_> = lock(&self.probes).drain(..).collect();
        if waiting.is_empty() {
            if let Err(e) = self.send(&Message::KeepAlive).await {
                debug!(session = %self.id, "Keep-alive reply failed: {e}");
            }
        } else {
            for probe in waiting {
                let _ = probe.send(());
            }
        }
    }

    /// Closes the stream once. Returns `false` if it was already closed.
    pub async fn close(&self, reason: &str) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.state == SessionState::Disconnected {
                return false;
            }
            inner.state = SessionState::Disconnected;
            inner.close_reason = Some(reason.to_string());
        }
        self.closed.send_replace(true);
        lock(&self.probes).clear();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(session = %self.id, "Closed stream with {}: {reason}", self.remote_addr);
        true
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Read loop of a connected session. Returns after the stream is closed
    /// and `handler.on_closed` has run.
    pub async fn run<H: SessionHandler>(
        self: Arc<Self>,
        mut reader: SessionReader,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let reason = loop {
            if *shutdown.borrow() {
                break "node shutting down".to_string();
            }
            let next = tokio::select! {
                next = reader.read() => next,
                _ = self.closed() => {
                    break self.close_reason().unwrap_or_else(|| "closed".to_string());
                }
                _ = stopped(&mut shutdown) => {
                    break "node shutting down".to_string();
                }
            };

            match next {
                Ok(message) => {
                    self.touch();
                    match message {
                        Message::Disconnect => break "peer disconnected".to_string(),
                        Message::KeepAlive => self.on_keep_alive().await,
                        Message::Handshake { username, .. } => {
                            warn!(session = %self.id, "Ignoring repeated handshake from {username}");
                        }
                        message => handler.on_message(&self, message),
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(session = %self.id, "Discarding malformed message from {}: {e}", self.remote_addr);
                }
                Err(CodecError::Closed) => break "connection closed by peer".to_string(),
                Err(e) => break format!("read failed: {e}"),
            }
        };

        if !self.close(&reason).await {
            debug!(session = %self.id, "Read loop ended on closed session");
        }
        let reason = self.close_reason().unwrap_or(reason);
        info!(session = %self.id, "Session with {} ended: {reason}", self.remote_addr);
        handler.on_closed(&self, &reason);
    }

    /// Probes the peer whenever it has been silent for `interval`; a failed
    /// probe closes the session, which ends its read loop.
    pub async fn watch_idle(self: Arc<Self>, interval: Duration, probe_timeout: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.closed() => return,
            }
            if self.idle_for() < interval {
                continue;
            }
            if let Err(e) = self.probe(probe_timeout).await {
                if !self.is_closed() {
                    info!(session = %self.id, "Peer {} failed keep-alive: {e}", self.remote_addr);
                    self.close("keep-alive timeout").await;
                }
                return;
            }
        }
    }
}

/// Resolves once the node-wide stop flag is raised.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("inner", &*lock(&self.inner))
            .finish()
    }
}
