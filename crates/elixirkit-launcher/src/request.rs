//! Launch request parsing and launcher paths.

use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;

/// Prefix of the single argument a URL handler passes, e.g. `open:http://...`.
pub const OPEN_PREFIX: &str = "open:";

/// Extract the URL from an `open:<url>` launch argument.
///
/// Returns the normalized absolute URL, or an empty string when there is no
/// argument or it is not an open request. The release treats an empty URL as
/// "open the home page".
pub fn open_url(request: Option<&str>) -> Result<String> {
    let Some(target) = request.and_then(|arg| arg.strip_prefix(OPEN_PREFIX)) else {
        return Ok(String::new());
    };

    let url = Url::parse(target).with_context(|| format!("Invalid URL in open request: {}", target))?;
    Ok(url.into())
}

/// Default release log file: `<local data dir>/<app>/Logs/<app>.log`.
pub fn default_log_path(app_name: &str) -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir().context("Could not determine local data directory")?;
    Ok(data_dir
        .join(app_name)
        .join("Logs")
        .join(format!("{}.log", app_name)))
}

/// Message shown when the release exits abnormally.
pub fn exit_message(app_name: &str, code: i32, log_path: &std::path::Path) -> String {
    format!(
        "{} exited with exit code {}.\nLogs available at: {}",
        app_name,
        code,
        log_path.display()
    )
}
