//! Integration tests for the ElixirKit facade.
//!
//! A bash script stands in for the release: it connects back to
//! `ELIXIRKIT_PORT` over `/dev/tcp`, appends every line it receives to
//! `$RECORD`, exits 0 on a `shutdown` event, and exits `$EOF_EXIT_CODE` when
//! the control channel closes.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elixirkit::{
    ElixirKit, ElixirKitBuilder, ElixirKitError, EventMessage, InstanceRole, ReleaseConfig,
    StartOptions,
};
use tempfile::TempDir;

const FAKE_RELEASE: &str = r#"#!/usr/bin/env bash
echo "fake release starting"
exec 3<>"/dev/tcp/127.0.0.1/$ELIXIRKIT_PORT"
while IFS= read -r line <&3; do
  printf '%s\n' "$line" >> "$RECORD"
  if [ "$line" = "event:shutdown:" ]; then
    exit 0
  fi
done
exit "${EOF_EXIT_CODE:-0}"
"#;

/// Serializes writing scripts and spawning them, so no child inherits a
/// script that is still open for writing (ETXTBSY).
static SPAWN_GUARD: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn app_dir(&self) -> PathBuf {
        self.temp_dir.path().join("app")
    }

    fn runtime_dir(&self) -> PathBuf {
        self.temp_dir.path().join("run")
    }

    fn record_path(&self) -> PathBuf {
        self.temp_dir.path().join("received.log")
    }

    fn builder(&self, id: Option<&str>) -> ElixirKitBuilder {
        let mut builder = ElixirKit::builder()
            .runtime_dir(self.runtime_dir())
            .app_dir(self.app_dir())
            .relay_connect_timeout(Duration::from_secs(2))
            .backend_connect_timeout(Some(Duration::from_secs(10)));
        if let Some(id) = id {
            builder = builder.id(id);
        }
        builder
    }

    /// Install the fake release at `<app_dir>/rel/bin/<name>`.
    fn install_release(&self, name: &str) -> PathBuf {
        let bin_dir = self.app_dir().join("rel").join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let script = bin_dir.join(name);
        std::fs::write(&script, FAKE_RELEASE).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn options(&self, eof_exit_code: i32) -> StartOptions {
        StartOptions::new()
            .env("RECORD", self.record_path().to_string_lossy())
            .env("EOF_EXIT_CODE", eof_exit_code.to_string())
    }

    /// Release config that runs the fake release through bash.
    fn bash_config(&self, eof_exit_code: i32) -> ReleaseConfig {
        let script = self.temp_dir.path().join("release.sh");
        std::fs::write(&script, FAKE_RELEASE).unwrap();
        ReleaseConfig::new("bash")
            .with_args([script.to_string_lossy().to_string(), "start".to_string()])
            .with_env("RECORD", self.record_path().to_string_lossy())
            .with_env("EOF_EXIT_CODE", eof_exit_code.to_string())
    }

    async fn start(&self, kit: &mut ElixirKit, eof_exit_code: i32) {
        let _guard = SPAWN_GUARD.lock().await;
        let config = self.bash_config(eof_exit_code);
        kit.as_main_mut("start")
            .unwrap()
            .start_release(config, None)
            .await
            .unwrap();
    }

    /// Poll the record file until it holds `count` lines.
    async fn wait_for_record(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let lines = read_lines(&self.record_path());
            if lines.len() >= count {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        read_lines(&self.record_path())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_demo_publish_reaches_release() {
    let env = TestEnv::new();
    let mut kit = env.builder(Some("com.example.Demo")).build().unwrap();
    assert!(kit.is_main());

    env.start(&mut kit, 0).await;
    kit.publish("log", "Hello from Windows Forms!").await.unwrap();

    let lines = env.wait_for_record(1).await;
    assert_eq!(lines, vec!["event:log:SGVsbG8gZnJvbSBXaW5kb3dzIEZvcm1zIQ=="]);

    assert_eq!(kit.stop().await.unwrap(), 0);
}

#[tokio::test]
async fn test_start_resolves_release_layout() {
    let env = TestEnv::new();
    let mut kit = env.builder(None).build().unwrap();

    {
        let _guard = SPAWN_GUARD.lock().await;
        let script = env.install_release("demo");
        let release = kit.start("demo", env.options(0)).await.unwrap();
        assert_eq!(release.program(), script.as_path());
        assert!(release.port() > 0);
    }

    kit.publish("log", "started by name").await.unwrap();
    let lines = env.wait_for_record(1).await;
    assert_eq!(
        EventMessage::decode(&lines[0]).unwrap(),
        EventMessage::new("log", "started by name").unwrap()
    );

    assert_eq!(kit.stop().await.unwrap(), 0);
}

#[tokio::test]
async fn test_secondary_instance_relays_to_release() {
    let env = TestEnv::new();
    let mut main = env.builder(Some("dev.livebook.Livebook")).build().unwrap();
    env.start(&mut main, 0).await;
    assert!(main.as_main("is_relaying").unwrap().is_relaying());

    let secondary = env.builder(Some("dev.livebook.Livebook")).build().unwrap();
    assert_eq!(secondary.role(), InstanceRole::Secondary);
    secondary.publish("open", "http://x/y").await.unwrap();

    let lines = env.wait_for_record(1).await;
    assert_eq!(lines, vec!["event:open:aHR0cDovL3gveQ=="]);

    main.publish("shutdown", "").await.unwrap();
    assert_eq!(main.wait_for_exit().await.unwrap(), 0);
    assert_eq!(
        env.wait_for_record(2).await,
        vec!["event:open:aHR0cDovL3gveQ==", "event:shutdown:"]
    );
    assert!(main.has_exited().unwrap());
}

#[tokio::test]
async fn test_relayed_data_survives_delimiters() {
    let env = TestEnv::new();
    let mut main = env.builder(Some("com.example.Relay")).build().unwrap();
    env.start(&mut main, 0).await;

    let secondary = env.builder(Some("com.example.Relay")).build().unwrap();
    let data = "line one\nline two: with colon\r\n";
    secondary.publish("open", data).await.unwrap();

    let lines = env.wait_for_record(1).await;
    assert_eq!(lines.len(), 1);
    let decoded = EventMessage::decode(&lines[0]).unwrap();
    assert_eq!(decoded.name, "open");
    assert_eq!(decoded.data, data);

    main.stop().await.unwrap();
}

#[tokio::test]
async fn test_exit_code_reaches_handler_once() {
    let env = TestEnv::new();
    let mut kit = env.builder(None).build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (code_tx, code_rx) = std::sync::mpsc::channel();

    {
        let _guard = SPAWN_GUARD.lock().await;
        let calls = calls.clone();
        let on_exit: elixirkit::ExitHandler = Box::new(move |code: i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = code_tx.send(code);
        });
        kit.as_main_mut("start")
            .unwrap()
            .start_release(env.bash_config(42), Some(on_exit))
            .await
            .unwrap();
    }

    assert_eq!(kit.stop().await.unwrap(), 42);
    assert_eq!(kit.wait_for_exit().await.unwrap(), 42);

    let reported = tokio::task::spawn_blocking(move || {
        code_rx.recv_timeout(Duration::from_secs(5)).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(reported, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_after_exit_returns_cached_code() {
    let env = TestEnv::new();
    let mut kit = env.builder(None).build().unwrap();
    env.start(&mut kit, 3).await;

    kit.publish("shutdown", "").await.unwrap();
    assert_eq!(kit.wait_for_exit().await.unwrap(), 0);

    assert_eq!(kit.stop().await.unwrap(), 0);
    assert_eq!(kit.stop().await.unwrap(), 0);

    let result = kit.publish("log", "too late").await;
    assert!(result.is_err());
    assert!(result.unwrap_err().is_transport());
}

#[tokio::test]
async fn test_start_twice_fails() {
    let env = TestEnv::new();
    let mut kit = env.builder(None).build().unwrap();
    env.start(&mut kit, 0).await;

    let second = kit
        .as_main_mut("start")
        .unwrap()
        .start_release(env.bash_config(0), None)
        .await;
    assert!(matches!(second, Err(ElixirKitError::AlreadyStarted)));

    kit.stop().await.unwrap();
}

#[tokio::test]
async fn test_backend_exiting_before_connect() {
    let env = TestEnv::new();
    let mut kit = env.builder(None).build().unwrap();
    let script = env.temp_dir.path().join("crash.sh");
    std::fs::write(&script, "echo 'boot failed' >&2\nexit 1\n").unwrap();

    let result = {
        let _guard = SPAWN_GUARD.lock().await;
        let config = ReleaseConfig::new("bash")
            .with_args([script.to_string_lossy().to_string()])
            .with_log_file(env.temp_dir.path().join("Logs").join("Crash.log"));
        kit.as_main_mut("start")
            .unwrap()
            .start_release(config, None)
            .await
            .map(|_| ())
    };

    assert!(matches!(result, Err(ElixirKitError::BackendExited { code: 1 })));
    assert!(matches!(kit.stop().await, Err(ElixirKitError::NotStarted)));

    let log = std::fs::read_to_string(env.temp_dir.path().join("Logs").join("Crash.log")).unwrap();
    assert!(log.contains("boot failed"));
}

#[tokio::test]
async fn test_secondary_rejects_main_only_operations() {
    let env = TestEnv::new();
    let _main = env.builder(Some("com.example.Roles")).build().unwrap();
    let mut secondary = env.builder(Some("com.example.Roles")).build().unwrap();
    assert!(!secondary.is_main());

    assert!(matches!(
        secondary.start("demo", StartOptions::new()).await,
        Err(ElixirKitError::NotMainInstance { operation: "start" })
    ));
    assert!(matches!(
        secondary.stop().await,
        Err(ElixirKitError::NotMainInstance { operation: "stop" })
    ));
    assert!(matches!(
        secondary.wait_for_exit().await,
        Err(ElixirKitError::NotMainInstance {
            operation: "wait_for_exit"
        })
    ));
    let has_exited = secondary.has_exited();
    assert!(has_exited.is_err());
    assert!(has_exited.unwrap_err().is_role_violation());
}

#[tokio::test]
async fn test_secondary_without_relay_fails_fast() {
    let env = TestEnv::new();
    // Main instance holds the lock but never starts its release.
    let _main = env.builder(Some("com.example.Idle")).build().unwrap();
    let secondary = env
        .builder(Some("com.example.Idle"))
        .relay_connect_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let result = secondary.publish("open", "http://x/y").await;
    assert!(matches!(
        result,
        Err(ElixirKitError::RelayUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_lock_released_when_main_dropped() {
    let env = TestEnv::new();
    let main = env.builder(Some("com.example.Restart")).build().unwrap();
    assert!(main.is_main());
    assert!(!env.builder(Some("com.example.Restart")).build().unwrap().is_main());

    drop(main);

    let next = env.builder(Some("com.example.Restart")).build().unwrap();
    assert!(next.is_main());
}

#[tokio::test]
async fn test_relay_endpoint_removed_after_stop() {
    let env = TestEnv::new();
    let mut kit = env.builder(Some("com.example.Cleanup")).build().unwrap();
    env.start(&mut kit, 0).await;

    let socket = kit
        .as_main("relay_endpoint")
        .unwrap()
        .relay_endpoint()
        .unwrap()
        .socket_path()
        .to_path_buf();
    assert!(socket.exists());

    kit.stop().await.unwrap();
    assert!(!socket.exists());
    assert!(!kit.as_main("is_relaying").unwrap().is_relaying());
}

#[tokio::test]
async fn test_relay_stops_when_release_exits() {
    let env = TestEnv::new();
    let mut main = env.builder(Some("com.example.Exited")).build().unwrap();
    env.start(&mut main, 0).await;

    let socket = main
        .as_main("relay_endpoint")
        .unwrap()
        .relay_endpoint()
        .unwrap()
        .socket_path()
        .to_path_buf();

    main.publish("shutdown", "").await.unwrap();
    assert_eq!(main.wait_for_exit().await.unwrap(), 0);

    for _ in 0..100 {
        if !main.as_main("is_relaying").unwrap().is_relaying() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!main.as_main("is_relaying").unwrap().is_relaying());
    assert!(!socket.exists());

    // The lock is still held, so a later launch is secondary but has no one
    // to deliver to.
    let secondary = env
        .builder(Some("com.example.Exited"))
        .relay_connect_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    assert_eq!(secondary.role(), InstanceRole::Secondary);
    let result = secondary.publish("open", "http://x/y").await;
    assert!(matches!(
        result,
        Err(ElixirKitError::RelayUnavailable { .. })
    ));
    assert_eq!(read_lines(&env.record_path()), vec!["event:shutdown:"]);
}
