//! Relay client for secondary instances.
//!
//! Each send is a short-lived connection: connect, write one line, close. A
//! secondary instance can win the race against a main instance that holds the
//! lock but has not bound its endpoint yet, so the connect retries until the
//! timeout and only then fails with `RelayUnavailable`.

use super::endpoint::RelayEndpoint;
use crate::codec::EventMessage;
use crate::config::{ChannelConfig, RelayConfig};
use crate::error::{ElixirKitError, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

/// Sender used by secondary instances to reach the main instance.
#[derive(Debug, Clone)]
pub struct RelayClient {
    endpoint: RelayEndpoint,
    connect_timeout: Duration,
}

impl RelayClient {
    pub fn new(endpoint: RelayEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: RelayConfig::CONNECT_TIMEOUT,
        }
    }

    /// Set how long `send_line` waits for the main instance's endpoint.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    /// Encode and relay an event.
    pub async fn publish(&self, message: &EventMessage) -> Result<()> {
        self.send_line(&message.encode()).await
    }

    /// Deliver one encoded line to the main instance.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut stream = self.connect().await?;

        let frame = format!("{}{}", line, ChannelConfig::LINE_TERMINATOR);
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;

        debug!("Relayed {} bytes to {}", frame.len(), self.endpoint);
        Ok(())
    }

    fn unavailable(&self, reason: impl ToString) -> ElixirKitError {
        ElixirKitError::RelayUnavailable {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Connect to the socket, retrying while it is missing or refusing
    /// connections, until the timeout runs out.
    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream> {
        use std::io::ErrorKind;

        let path = self.endpoint.socket_path();
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let connect = tokio::net::UnixStream::connect(path);

            let last_error = match tokio::time::timeout(remaining, connect).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e))
                    if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) =>
                {
                    e
                }
                Ok(Err(e)) => return Err(self.unavailable(e)),
                Err(_) => {
                    return Err(self.unavailable(format!(
                        "no main instance accepted within {:?}",
                        self.connect_timeout
                    )))
                }
            };

            if Instant::now() + RelayConfig::CONNECT_RETRY > deadline {
                return Err(self.unavailable(last_error));
            }
            tokio::time::sleep(RelayConfig::CONNECT_RETRY).await;
        }
    }

    /// Open the pipe, retrying while every server instance is busy or the
    /// server is between instances, until the timeout runs out.
    #[cfg(windows)]
    async fn connect(&self) -> Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        use tokio::net::windows::named_pipe::ClientOptions;

        const ERROR_PIPE_BUSY: i32 = 231;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let last_error = match ClientOptions::new().open(self.endpoint.pipe_name()) {
                Ok(client) => return Ok(client),
                Err(e)
                    if e.raw_os_error() == Some(ERROR_PIPE_BUSY)
                        || e.kind() == std::io::ErrorKind::NotFound =>
                {
                    e
                }
                Err(e) => return Err(self.unavailable(e)),
            };

            if Instant::now() >= deadline {
                return Err(self.unavailable(last_error));
            }
            tokio::time::sleep(RelayConfig::CONNECT_RETRY).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::arbiter::AppId;
    use crate::relay::server::tests::RecordingSink;
    use crate::relay::RelayServer;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn endpoint(dir: &TempDir, id: &str) -> RelayEndpoint {
        RelayEndpoint::new(dir.path(), &AppId::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_publish_reaches_main_instance() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = endpoint(&temp_dir, "dev.livebook.Livebook");
        let sink = Arc::new(RecordingSink::default());
        let _server = RelayServer::start(endpoint.clone(), sink.clone())
            .await
            .unwrap();

        let client = RelayClient::new(endpoint);
        let message = EventMessage::new("open", "http://x/y").unwrap();
        client.publish(&message).await.unwrap();

        let lines = sink.wait_for_lines(1).await;
        assert_eq!(lines, vec!["event:open:aHR0cDovL3gveQ=="]);
        assert_eq!(EventMessage::decode(&lines[0]).unwrap(), message);
    }

    #[tokio::test]
    async fn test_sequential_sends_arrive_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = endpoint(&temp_dir, "com.example.Demo");
        let sink = Arc::new(RecordingSink::default());
        let _server = RelayServer::start(endpoint.clone(), sink.clone())
            .await
            .unwrap();

        let client = RelayClient::new(endpoint);
        for i in 0..5 {
            let message = EventMessage::new("log", format!("message {}", i)).unwrap();
            client.publish(&message).await.unwrap();
        }

        let data: Vec<String> = sink
            .wait_for_lines(5)
            .await
            .iter()
            .map(|line| EventMessage::decode(line).unwrap().data)
            .collect();
        let expected: Vec<String> = (0..5).map(|i| format!("message {}", i)).collect();
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn test_no_main_instance_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let client = RelayClient::new(endpoint(&temp_dir, "com.example.Missing"))
            .with_connect_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = client.send_line("event:log:").await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        match result {
            Err(ElixirKitError::RelayUnavailable { endpoint, .. }) => {
                assert!(endpoint.contains("com.example.Missing"));
            }
            other => panic!("Expected RelayUnavailable, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_waits_for_late_main_instance() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = endpoint(&temp_dir, "com.example.Late");
        let client = RelayClient::new(endpoint.clone()).with_connect_timeout(Duration::from_secs(3));

        let publishing = tokio::spawn(async move {
            let message = EventMessage::new("open", "http://x/y").unwrap();
            client.publish(&message).await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let sink = Arc::new(RecordingSink::default());
        let _server = RelayServer::start(endpoint, sink.clone()).await.unwrap();

        publishing.await.unwrap().unwrap();
        assert_eq!(sink.wait_for_lines(1).await, vec!["event:open:aHR0cDovL3gveQ=="]);
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = endpoint(&temp_dir, "com.example.Stale");
        let listener = std::os::unix::net::UnixListener::bind(endpoint.socket_path()).unwrap();
        drop(listener);

        let client = RelayClient::new(endpoint).with_connect_timeout(Duration::from_millis(200));
        let result = client.send_line("event:log:").await;
        assert!(matches!(result, Err(ElixirKitError::RelayUnavailable { .. })));
    }
}
