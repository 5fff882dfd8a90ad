//! Relay server for the main instance.
//!
//! The endpoint is a single-shot mailbox: each secondary instance connects,
//! writes one line and disconnects. The server handles one client at a time,
//! so it never tracks concurrent client state.
//!
//! Lines are decoded before forwarding. Empty or malformed input is logged and
//! dropped, and the loop keeps serving; a bad client must not take the main
//! instance down. The loop stops when shut down, when the sink closes, or when
//! forwarding fails at the transport level; on Unix the socket is removed then
//! so later launches see no main instance instead of a silent mailbox.

use super::endpoint::RelayEndpoint;
use crate::channel::EventSink;
use crate::codec::EventMessage;
use crate::config::RelayConfig;
use crate::error::{ElixirKitError, Result};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to one client's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded,
    /// Client disconnected without writing a line.
    Empty,
    /// Input was unreadable or not a valid event line.
    Dropped,
}

/// Handle to a running relay server. Dropping shuts the server down.
pub struct RelayServerHandle {
    endpoint: RelayEndpoint,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServerHandle {
    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    /// Whether the accept loop is still alive.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop accepting clients, remove the endpoint and wait for the accept
    /// loop to finish.
    pub async fn shutdown(&self) {
        self.signal_shutdown();

        let handle = match self.task_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Relay server task failed: {}", e);
                }
            }
        }
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        #[cfg(unix)]
        remove_socket(&self.endpoint);
    }
}

impl Drop for RelayServerHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Ok(slot) = self.task_handle.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(unix)]
fn remove_socket(endpoint: &RelayEndpoint) {
    match std::fs::remove_file(endpoint.socket_path()) {
        Ok(()) => debug!("Removed relay socket {}", endpoint),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove relay socket {}: {}", endpoint, e),
    }
}

/// Relay server that forwards secondary-instance lines into an `EventSink`.
pub struct RelayServer;

impl RelayServer {
    /// Create the endpoint and start the accept loop in a background task.
    ///
    /// Must only be called by the holder of the instance lock; on Unix a
    /// leftover socket from a crashed main instance is removed first.
    pub async fn start<S: EventSink>(
        endpoint: RelayEndpoint,
        sink: Arc<S>,
    ) -> Result<RelayServerHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        #[cfg(unix)]
        let task_handle = {
            let listener = Self::bind_socket(&endpoint)?;
            tokio::spawn(Self::accept_loop(
                listener,
                endpoint.clone(),
                sink,
                shutdown_rx,
            ))
        };

        #[cfg(windows)]
        let task_handle = {
            use tokio::net::windows::named_pipe::ServerOptions;

            let pipe_name = endpoint.pipe_name().to_string();
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&pipe_name)
                .map_err(|e| ElixirKitError::RelayUnavailable {
                    endpoint: pipe_name.clone(),
                    reason: e.to_string(),
                })?;
            tokio::spawn(Self::accept_loop(pipe_name, first, sink, shutdown_rx))
        };

        info!("Relay server listening on {}", endpoint);

        Ok(RelayServerHandle {
            endpoint,
            shutdown_tx,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    #[cfg(unix)]
    fn bind_socket(endpoint: &RelayEndpoint) -> Result<tokio::net::UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        let path = endpoint.socket_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ElixirKitError::io_with_path(e, parent))?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale relay socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ElixirKitError::io_with_path(e, path)),
        }

        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|e| ElixirKitError::io_with_path(e, path))?;

        // Owner-only: any local process that can connect can inject events.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ElixirKitError::io_with_path(e, path))?;

        Ok(listener)
    }

    #[cfg(unix)]
    async fn accept_loop<S: EventSink>(
        listener: tokio::net::UnixListener,
        endpoint: RelayEndpoint,
        sink: Arc<S>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let stream = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Relay server shutting down");
                    break;
                }
                _ = sink.closed() => {
                    info!("Control channel closed, stopping relay server");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!("Relay accept error: {}", e);
                            tokio::time::sleep(RelayConfig::ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    }
                }
            };

            if !Self::serve_client(stream, &*sink).await {
                break;
            }
        }

        // Unbinding alone leaves the path behind; clients would get
        // ConnectionRefused rather than NotFound.
        drop(listener);
        if !*shutdown_rx.borrow() {
            remove_socket(&endpoint);
        }
    }

    #[cfg(windows)]
    async fn accept_loop<S: EventSink>(
        pipe_name: String,
        first: tokio::net::windows::named_pipe::NamedPipeServer,
        sink: Arc<S>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut server = first;
        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Relay server shutting down");
                    break;
                }
                _ = sink.closed() => {
                    info!("Control channel closed, stopping relay server");
                    break;
                }
                result = server.connect() => result,
            };

            // Fresh instance for the next client before serving this one.
            let next = match ServerOptions::new().create(&pipe_name) {
                Ok(next) => next,
                Err(e) => {
                    error!("Failed to create relay pipe {}: {}", pipe_name, e);
                    break;
                }
            };
            let mut current = std::mem::replace(&mut server, next);

            match connected {
                Ok(()) => {
                    let keep_going = Self::serve_client(&mut current, &*sink).await;
                    let _ = current.disconnect();
                    if !keep_going {
                        break;
                    }
                }
                Err(e) => {
                    error!("Relay accept error: {}", e);
                    tokio::time::sleep(RelayConfig::ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Serve one client. Returns `false` when the loop should stop.
    async fn serve_client<R, S>(reader: R, sink: &S) -> bool
    where
        R: AsyncRead + Unpin,
        S: EventSink + ?Sized,
    {
        match forward(reader, sink).await {
            Ok(_) => true,
            Err(ElixirKitError::ChannelClosed) => {
                info!("Control channel closed, stopping relay server");
                false
            }
            Err(e) if e.is_transport() => {
                error!("Control channel unusable, stopping relay server: {}", e);
                false
            }
            Err(e) => {
                error!("Failed to forward relayed event: {}", e);
                true
            }
        }
    }
}

/// Read one line from a relay client and forward it if it is a valid event.
///
/// Only sink failures are returned as errors; bad input is reported through
/// the outcome.
pub async fn forward<R, S>(reader: R, sink: &S) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin,
    S: EventSink + ?Sized,
{
    let line = match read_line(reader).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("Relay client disconnected without writing");
            return Ok(RelayOutcome::Empty);
        }
        Err(e) => {
            warn!("Dropping unreadable relay input: {}", e);
            return Ok(RelayOutcome::Dropped);
        }
    };

    match EventMessage::decode(&line) {
        Ok(message) => {
            debug!("Forwarding relayed event {:?}", message.name);
            sink.send_line(&line).await?;
            Ok(RelayOutcome::Forwarded)
        }
        Err(e) => {
            warn!("Dropping malformed relay input: {}", e);
            Ok(RelayOutcome::Dropped)
        }
    }
}

/// Read a single line, without its terminator. `None` for no input.
async fn read_line<R: AsyncRead + Unpin>(reader: R) -> io::Result<Option<String>> {
    let mut reader = BufReader::new(reader.take(RelayConfig::MAX_LINE_BYTES));
    let mut buf = Vec::new();

    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") && n as u64 >= RelayConfig::MAX_LINE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "relay line exceeds size limit",
        ));
    }

    let line = String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "relay line is not UTF-8"))?;
    let line = line.trim_end_matches(['\r', '\n']);

    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}
