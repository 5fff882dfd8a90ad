//! ElixirKit Launcher - desktop front end for a bundled release.
//!
//! The first launch owns the release: it starts `rel/bin/<release>` next to
//! the executable, forwards the launch URL to it, and keeps it running until
//! Ctrl-C or until the release exits on its own. Later launches (e.g. a URL
//! handler invocation) hand their URL to the running instance and exit.

mod request;

use anyhow::Result;
use clap::Parser;
use elixirkit::{ElixirKit, MainInstance, SecondaryInstance, StartOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "elixirkit-launcher")]
#[command(about = "Launch a bundled release, or hand a URL to the running instance")]
struct Args {
    /// Application id shared by every launch of the app
    #[arg(long, default_value = "dev.livebook.Livebook")]
    id: String,

    /// Display name, also used for the default log location
    #[arg(long, default_value = "Livebook")]
    app_name: String,

    /// Release script name under rel/bin
    #[arg(long, default_value = "app")]
    release: String,

    /// Release log file (defaults to <local data dir>/<app>/Logs/<app>.log)
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Directory containing rel/ (defaults to the executable's directory)
    #[arg(long)]
    app_dir: Option<PathBuf>,

    /// Directory for the instance lock and relay socket
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Seconds a second launch waits for the running instance
    #[arg(long, default_value = "5")]
    relay_timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Launch request, e.g. `open:https://example.com`
    request: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let url = request::open_url(args.request.as_deref())?;

    let mut builder = ElixirKit::builder()
        .id(&args.id)
        .relay_connect_timeout(Duration::from_secs(args.relay_timeout));
    if let Some(dir) = &args.app_dir {
        builder = builder.app_dir(dir);
    }
    if let Some(dir) = &args.runtime_dir {
        builder = builder.runtime_dir(dir);
    }

    match builder.build()? {
        ElixirKit::Main(main) => run_main(main, &args, &url).await,
        ElixirKit::Secondary(secondary) => run_secondary(secondary, &url).await,
    }
}

/// Own the release until Ctrl-C or until it exits.
async fn run_main(mut main: MainInstance, args: &Args, url: &str) -> Result<ExitCode> {
    let log_path = match &args.log_path {
        Some(path) => path.clone(),
        None => request::default_log_path(&args.app_name)?,
    };
    info!("Starting {} (logs at {})", args.app_name, log_path.display());

    let (exited_tx, exited_rx) = oneshot::channel();
    let options = StartOptions::new()
        .log_path(&log_path)
        .on_exit(move |code| {
            let _ = exited_tx.send(code);
        });
    main.start(&args.release, options).await?;
    main.publish("open", url).await?;

    tokio::select! {
        _ = exited_rx => info!("{} exited on its own", args.app_name),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
    }

    if !main.has_exited()? {
        if let Err(e) = main.publish("shutdown", "").await {
            warn!("Failed to send shutdown event: {}", e);
        }
    }

    let code = main.wait_for_exit().await?;
    if code == 0 {
        return Ok(ExitCode::SUCCESS);
    }

    error!("{}", request::exit_message(&args.app_name, code, &log_path));
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Hand the URL to the running instance.
async fn run_secondary(secondary: SecondaryInstance, url: &str) -> Result<ExitCode> {
    info!("{} is already running, forwarding request", secondary.id());
    secondary.publish("open", url).await?;
    Ok(ExitCode::SUCCESS)
}
