//! Event message codec.
//!
//! Defines the single-line wire format shared by the control channel and the
//! relay pipe:
//!
//! ```text
//! event:<name>:<base64(UTF-8 bytes of data)>\n
//! ```
//!
//! Base64 output never contains `:` or line terminators, so arbitrary data
//! cannot break the one-message-per-line framing. Names are validated instead
//! of encoded.

use crate::error::{ElixirKitError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Prefix of every transport line.
pub const EVENT_PREFIX: &str = "event";
/// Separator between the three parts of a transport line.
pub const SEPARATOR: char = ':';

/// A named event with a text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub name: String,
    pub data: String,
}

impl EventMessage {
    /// Create a new event, validating the name.
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            data: data.into(),
        })
    }

    /// Encode into a transport line, without the line terminator.
    pub fn encode(&self) -> String {
        format!(
            "{EVENT_PREFIX}{SEPARATOR}{}{SEPARATOR}{}",
            self.name,
            STANDARD.encode(self.data.as_bytes())
        )
    }

    /// Decode a transport line.
    ///
    /// A single trailing `\n` or `\r\n` is tolerated. Anything that is not
    /// exactly `event:<name>:<base64>` with a valid name and UTF-8 payload is
    /// rejected with `MalformedLine`.
    pub fn decode(line: &str) -> Result<Self> {
        let trimmed = line
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(line);

        let malformed = |reason: &str| ElixirKitError::MalformedLine {
            line: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = trimmed.splitn(3, SEPARATOR);
        let (Some(prefix), Some(name), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected three colon-separated parts"));
        };

        if prefix != EVENT_PREFIX {
            return Err(malformed("missing event prefix"));
        }

        validate_name(name).map_err(|_| malformed("invalid event name"))?;

        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| malformed(&format!("invalid base64 payload: {}", e)))?;
        let data = String::from_utf8(bytes).map_err(|_| malformed("payload is not UTF-8"))?;

        Ok(Self {
            name: name.to_string(),
            data,
        })
    }
}

/// Encode a name/data pair into a transport line.
pub fn encode_event(name: &str, data: &str) -> Result<String> {
    Ok(EventMessage::new(name, data)?.encode())
}

fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains(SEPARATOR) {
        "name contains ':'"
    } else if name.contains(['\n', '\r']) {
        "name contains a line terminator"
    } else {
        return Ok(());
    };

    Err(ElixirKitError::InvalidEventName {
        name: name.to_string(),
        reason,
    })
}
