//! Release process supervision.
//!
//! A release is the long-running backend started from
//! `<app_dir>/rel/bin/<name> start`. The supervisor:
//! - binds the control channel before spawning, and passes its port through
//!   `ELIXIRKIT_PORT`
//! - pipes stdout/stderr line by line into a `LogSink` and a broadcast channel
//! - publishes the exit code on a watch channel and fires the exit handler once
//! - blocks `start` until the release connects back (or exits first)
//!
//! # Exit codes
//!
//! The release's exit code is passed through verbatim. On Unix a release
//! killed by a signal reports `128 + signal`; if no code can be determined at
//! all, `-1` is reported.

use crate::channel::ControlChannel;
use crate::codec::EventMessage;
use crate::config::{ChannelConfig, ReleaseLayout};
use crate::error::{ElixirKitError, Result};
use crate::platform;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback fired once, off the caller's thread, with the release's exit code.
pub type ExitHandler = Box<dyn FnOnce(i32) + Send + 'static>;

/// Where captured release output goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogSink {
    /// Mirror stdout to stdout and stderr to stderr.
    #[default]
    Console,
    /// Append every line to a file, creating it (and its parent) if missing.
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line of release output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Configuration for launching a release.
#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    /// Executable or script to run.
    pub program: PathBuf,
    /// Arguments, `["start"]` by default.
    pub args: Vec<String>,
    /// Extra environment variables on top of the inherited environment.
    pub env_vars: HashMap<String, String>,
    pub log_sink: LogSink,
    /// Optional bound on waiting for the release to connect back.
    pub connect_timeout: Option<Duration>,
}

impl ReleaseConfig {
    /// Launch `program start`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![ReleaseLayout::START_COMMAND.to_string()],
            env_vars: HashMap::new(),
            log_sink: LogSink::Console,
            connect_timeout: None,
        }
    }

    /// Launch the release script `name` from the `rel/bin` directory under `app_dir`.
    pub fn for_release(app_dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(platform::release_script(app_dir.as_ref(), name))
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Append output to a log file instead of mirroring it to the console.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_sink = LogSink::File(path.as_ref().to_path_buf());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Open writer behind a `LogSink`.
enum SinkWriter {
    Console,
    File {
        path: PathBuf,
        file: Mutex<tokio::fs::File>,
    },
}

impl SinkWriter {
    async fn open(sink: &LogSink) -> Result<Self> {
        match sink {
            LogSink::Console => Ok(SinkWriter::Console),
            LogSink::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ElixirKitError::io_with_path(e, parent))?;
                }

                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| ElixirKitError::io_with_path(e, path))?;

                Ok(SinkWriter::File {
                    path: path.clone(),
                    file: Mutex::new(file),
                })
            }
        }
    }

    async fn write_line(&self, stream: OutputStream, line: &str) {
        match self {
            SinkWriter::Console => {
                let result = match stream {
                    OutputStream::Stdout => writeln!(std::io::stdout().lock(), "{}", line),
                    OutputStream::Stderr => writeln!(std::io::stderr().lock(), "{}", line),
                };
                if let Err(e) = result {
                    debug!("Failed to mirror release output: {}", e);
                }
            }
            SinkWriter::File { path, file } => {
                let mut file = file.lock().await;
                let frame = format!("{}{}", line, ChannelConfig::LINE_TERMINATOR);
                let result = match file.write_all(frame.as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to write release output to {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// A running (or exited) release supervised by the main instance.
pub struct Release {
    program: PathBuf,
    log_sink: LogSink,
    pid: Option<u32>,
    channel: Arc<ControlChannel>,
    exit_rx: watch::Receiver<Option<i32>>,
    output_tx: broadcast::Sender<OutputLine>,
    /// Kept open for the release's lifetime; the release may treat EOF on
    /// stdin as a shutdown request.
    _stdin: Option<ChildStdin>,
}

impl Release {
    /// Spawn the release and wait for it to connect to the control channel.
    ///
    /// Fails with `ReleaseNotFound`/`LaunchFailed` if the program cannot be
    /// started, `BackendExited` if it dies before connecting, and `Timeout`
    /// if `connect_timeout` is set and elapses.
    pub async fn start(config: ReleaseConfig, on_exit: Option<ExitHandler>) -> Result<Self> {
        let sink = Arc::new(SinkWriter::open(&config.log_sink).await?);
        let channel = Arc::new(ControlChannel::bind().await?);

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env_vars)
            .env(ChannelConfig::PORT_ENV_VAR, channel.port().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        #[cfg(windows)]
        {
            // No console window for the release.
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        info!("Launching release {}", config.program.display());

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn release {}: {}", config.program.display(), e);
            if e.kind() == std::io::ErrorKind::NotFound {
                ElixirKitError::ReleaseNotFound(config.program.clone())
            } else {
                ElixirKitError::LaunchFailed {
                    program: config.program.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let pid = child.id();
        info!("Launched release with PID {:?}", pid);

        let (output_tx, _) = broadcast::channel(ReleaseLayout::OUTPUT_CHANNEL_CAPACITY);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(
                stdout,
                OutputStream::Stdout,
                sink.clone(),
                output_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(
                stderr,
                OutputStream::Stderr,
                sink.clone(),
                output_tx.clone(),
            )));
        }
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            child,
            readers,
            kill_rx,
            channel.clone(),
            exit_tx,
            on_exit,
        ));

        let release = Self {
            program: config.program,
            log_sink: config.log_sink,
            pid,
            channel,
            exit_rx,
            output_tx,
            _stdin: stdin,
        };

        if let Err(e) = release.wait_for_connection(config.connect_timeout).await {
            release.channel.close().await;
            if !release.has_exited() {
                warn!("Release did not connect, killing it: {}", e);
                let _ = kill_tx.send(());
            }
            return Err(e);
        }

        Ok(release)
    }

    async fn wait_for_connection(&self, timeout: Option<Duration>) -> Result<()> {
        let accept = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, self.channel.accept())
                    .await
                    .map_err(|_| ElixirKitError::Timeout(limit))?,
                None => self.channel.accept().await,
            }
        };

        tokio::select! {
            biased;
            accepted = accept => match accepted {
                Ok(_) => Ok(()),
                // Only the exit watcher closes the channel before the release connects.
                Err(ElixirKitError::ChannelClosed) => Err(ElixirKitError::BackendExited {
                    code: self.wait_for_exit().await,
                }),
                Err(e) => Err(e),
            },
            code = self.wait_for_exit() => Err(ElixirKitError::BackendExited { code }),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Log file output is appended to, unless mirrored to the console.
    pub fn log_path(&self) -> Option<&Path> {
        match &self.log_sink {
            LogSink::File(path) => Some(path),
            LogSink::Console => None,
        }
    }

    /// OS process id, if the release was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Loopback port the release connected back to.
    pub fn port(&self) -> u16 {
        self.channel.port()
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// Send a raw encoded line to the release.
    pub async fn send(&self, line: &str) -> Result<()> {
        self.channel.send(line).await
    }

    /// Encode and send an event to the release.
    pub async fn publish(&self, name: &str, data: &str) -> Result<()> {
        let message = EventMessage::new(name, data)?;
        self.channel.publish(&message).await
    }

    /// Subscribe to captured output lines from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output_tx.subscribe()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit code, if the release has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Wait until the release exits and return its exit code.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut exit_rx = self.exit_rx.clone();
        let code = match exit_rx.wait_for(Option::is_some).await {
            Ok(code) => *code,
            // Exit watcher is gone without reporting; nothing left to wait for.
            Err(_) => *self.exit_rx.borrow(),
        };
        code.unwrap_or(-1)
    }

    /// Like `wait_for_exit`, bounded by `limit`.
    pub async fn wait_for_exit_timeout(&self, limit: Duration) -> Result<i32> {
        tokio::time::timeout(limit, self.wait_for_exit())
            .await
            .map_err(|_| ElixirKitError::Timeout(limit))
    }

    /// Ask the release to shut down and wait for it to exit.
    ///
    /// Closing the control channel is the shutdown signal. If the release has
    /// already exited, returns the cached exit code without touching the
    /// channel, so calling this repeatedly is safe.
    pub async fn stop(&self) -> i32 {
        if let Some(code) = self.exit_code() {
            debug!("Release already exited with code {}", code);
            return code;
        }

        if self.channel.close().await {
            info!("Requested release shutdown");
        }
        self.wait_for_exit().await
    }
}

/// Copy lines from a release pipe into the sink and the broadcast channel.
///
/// Reads raw bytes so invalid UTF-8 cannot stall the pipe. Empty lines are
/// skipped.
async fn pump_output<R>(
    reader: R,
    stream: OutputStream,
    sink: Arc<SinkWriter>,
    output_tx: broadcast::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                sink.write_line(stream, line).await;
                let _ = output_tx.send(OutputLine {
                    stream,
                    line: line.to_string(),
                });
            }
            Err(e) => {
                debug!("Release {:?} pipe closed: {}", stream, e);
                break;
            }
        }
    }
}

/// Wait for the release to exit, close the control channel, publish the
/// code, then fire the handler.
async fn watch_exit(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    kill_rx: oneshot::Receiver<()>,
    channel: Arc<ControlChannel>,
    exit_tx: watch::Sender<Option<i32>>,
    on_exit: Option<ExitHandler>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill release: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("Failed to wait for release: {}", e);
            -1
        }
    };

    let drained = tokio::time::timeout(ReleaseLayout::OUTPUT_DRAIN_TIMEOUT, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("Release output still open after exit, not waiting further");
    }

    info!("Release exited with code {}", code);
    // Later sends fail with ChannelClosed instead of writing into a dead socket.
    channel.close().await;
    let _ = exit_tx.send(Some(code));

    if let Some(handler) = on_exit {
        // Handlers may block (e.g. tear down a UI); keep them off the runtime workers.
        if let Err(e) = tokio::task::spawn_blocking(move || handler(code)).await {
            error!("Release exit handler panicked: {}", e);
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
