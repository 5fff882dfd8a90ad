//! Loopback control channel from the main instance to the release.
//!
//! The listener binds `127.0.0.1:0` before the release is spawned; its port is
//! handed to the release through `ELIXIRKIT_PORT` and the release connects back
//! exactly once. From then on the channel is write-only: every frame is one
//! encoded event line plus `\n`.
//!
//! # Thread Safety
//!
//! The connection sits behind a tokio `Mutex` and each line is written with a
//! single `write_all`, so concurrent senders (caller, relay loop, exit
//! handlers) never interleave partial lines.

use crate::codec::EventMessage;
use crate::config::ChannelConfig;
use crate::error::{ElixirKitError, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Destination for validated event lines.
///
/// Implemented by `ControlChannel`; the relay server forwards into any sink so
/// it can be exercised without a release process.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Send one encoded line (without terminator).
    async fn send_line(&self, line: &str) -> Result<()>;

    /// Resolves once the sink will not accept any more lines.
    ///
    /// Never resolves by default.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Single-client, write-only loopback channel to the release.
#[derive(Debug)]
pub struct ControlChannel {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    /// Wakes a pending `accept` when the channel is closed.
    close_tx: watch::Sender<bool>,
}

impl ControlChannel {
    /// Bind the listener on an ephemeral loopback port.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        info!("Control channel listening on {}", addr);

        Ok(Self {
            addr,
            listener: Mutex::new(Some(listener)),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx: watch::channel(false).0,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Block until the release connects.
    ///
    /// Only one client is ever expected; calling this again after a connection
    /// was accepted is an error. `close` unblocks a pending accept with
    /// `ChannelClosed`.
    pub async fn accept(&self) -> Result<SocketAddr> {
        let mut closed_rx = self.close_tx.subscribe();
        let listener = self.listener.lock().await;
        let listener = listener.as_ref().ok_or(ElixirKitError::ChannelClosed)?;

        if self.stream.lock().await.is_some() {
            return Err(ElixirKitError::AlreadyStarted);
        }

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = closed_rx.wait_for(|closed| *closed) => {
                return Err(ElixirKitError::ChannelClosed);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on control channel: {}", e);
        }

        {
            let mut slot = self.stream.lock().await;
            // `close` may have run while the connection was being accepted.
            if self.is_closed() {
                drop(stream);
                return Err(ElixirKitError::ChannelClosed);
            }
            *slot = Some(stream);
        }
        info!("Release connected to control channel from {}", peer);
        Ok(peer)
    }

    /// Whether the release has connected and the channel is still open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Write one line followed by the terminator.
    ///
    /// Fails with `ChannelClosed` once the channel was closed or never
    /// connected. Write failures are returned as-is; there is no reconnect.
    pub async fn send(&self, line: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let stream = stream.as_mut().ok_or(ElixirKitError::ChannelClosed)?;

        let frame = format!("{}{}", line, ChannelConfig::LINE_TERMINATOR);
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Encode and send an event.
    pub async fn publish(&self, message: &EventMessage) -> Result<()> {
        self.send(&message.encode()).await
    }

    /// Close the connection and the listener.
    ///
    /// The release sees EOF on its end and is expected to shut down. Returns
    /// `true` only for the call that actually tore the channel down.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Release a pending accept before taking the listener lock it holds.
        self.close_tx.send_replace(true);

        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Error shutting down control channel: {}", e);
            }
        }
        self.listener.lock().await.take();

        info!("Control channel on {} closed", self.addr);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until `close` has been called.
    pub async fn closed(&self) {
        let mut closed_rx = self.close_tx.subscribe();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }
}

#[async_trait::async_trait]
impl EventSink for ControlChannel {
    async fn send_line(&self, line: &str) -> Result<()> {
        self.send(line).await
    }

    async fn closed(&self) {
        ControlChannel::closed(self).await
    }
}
