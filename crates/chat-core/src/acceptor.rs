//! Accept loop for inbound peers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::session::stopped;

/// Pause after an accept error that is expected to clear up on its own.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Binds the listen socket on all IPv4 interfaces.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Hands every accepted stream to `on_stream` until the stop flag is
    /// raised or the listener fails for good. The listen socket is closed
    /// when this returns.
    pub async fn run<F>(self, mut shutdown: watch::Receiver<bool>, mut on_stream: F)
    where
        F: FnMut(TcpStream, SocketAddr) + Send,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = stopped(&mut shutdown) => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("Accepted connection from {addr}");
                    on_stream(stream, addr);
                }
                Err(e) if is_transient(&e) => {
                    warn!("Accept failed, retrying: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!("Accept loop stopped: {e}");
                    break;
                }
            }
        }
        info!("Stopped accepting connections");
    }
}

/// Errors that concern one pending connection or momentary resource
/// exhaustion rather than the listen socket itself.
fn is_transient(e: &io::Error) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}
