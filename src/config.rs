use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Errors produced while assembling the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("invalid client option (expected KEY=VALUE): {0}")]
    InvalidClientOption(String),
}

/// Signals we know how to name. Anything else can still be given
/// numerically.
const SIGNAL_TABLE: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("KILL", libc::SIGKILL),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("TERM", libc::SIGTERM),
    ("CONT", libc::SIGCONT),
    ("STOP", libc::SIGSTOP),
];

/// The signal delivered to a session's child process at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub code: i32,
    pub name: String,
}

impl Signal {
    /// Parse a signal from a name (`HUP`, `sighup`) or a number (`1`).
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let bare = match value.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("sig") && value.len() > 3 => &value[3..],
            _ => value,
        };

        if let Some((name, code)) = SIGNAL_TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(bare))
        {
            return Ok(Self {
                code: *code,
                name: format!("SIG{name}"),
            });
        }

        if let Ok(code) = bare.parse::<i32>() {
            if code > 0 {
                let name = SIGNAL_TABLE
                    .iter()
                    .find(|(_, c)| *c == code)
                    .map(|(name, _)| format!("SIG{name}"))
                    .unwrap_or_else(|| format!("SIG{code}"));
                return Ok(Self { code, name });
            }
        }

        Err(ConfigError::UnknownSignal(value.to_string()))
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self {
            code: libc::SIGHUP,
            name: "SIGHUP".to_string(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Immutable server configuration, built once at startup and shared
/// read-only across all sessions.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Program plus arguments spawned for each session; `command[0]` is
    /// the executable.
    pub command: Vec<String>,
    /// Shared secret; when set, clients must authenticate before a child
    /// is spawned.
    pub credential: Option<String>,
    /// Drop all client keystrokes.
    pub readonly: bool,
    /// Require the WebSocket `Origin` host to match the `Host` header.
    pub check_origin: bool,
    /// Serve a single session over the lifetime of the process, then
    /// exit 0.
    pub once: bool,
    /// Concurrent client cap; 0 means unlimited.
    pub max_clients: usize,
    /// Signal sent to the child when its session closes.
    pub term_signal: Signal,
    /// Reconnect interval hint sent to clients, in seconds.
    pub reconnect: u32,
    /// JSON preferences blob forwarded verbatim to the browser terminal.
    pub prefs_json: String,
    /// Local hostname, resolved at startup for the window title.
    pub hostname: String,
}

impl ServerConfig {
    /// Build a configuration with defaults for everything but the
    /// command.
    pub fn new(command: Vec<String>) -> Result<Self, ConfigError> {
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self {
            command,
            credential: None,
            readonly: false,
            check_origin: false,
            once: false,
            max_clients: 0,
            term_signal: Signal::default(),
            reconnect: 10,
            prefs_json: "{}".to_string(),
            hostname: resolve_hostname(),
        })
    }

    /// Title announced to clients: the program name plus the host it
    /// runs on.
    pub fn window_title(&self) -> String {
        format!("{} ({})", self.command[0], self.hostname)
    }
}

/// Assemble the preferences JSON object from repeated `KEY=VALUE` CLI
/// options. Values that parse as JSON scalars keep their type; anything
/// else becomes a string, so `-t fontSize=20 -t cursorBlink=true` works
/// without quoting gymnastics.
pub fn prefs_from_options(options: &[String]) -> Result<String, ConfigError> {
    let mut prefs = serde_json::Map::new();
    for option in options {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidClientOption(option.clone()))?;
        if key.is_empty() {
            return Err(ConfigError::InvalidClientOption(option.clone()));
        }
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        prefs.insert(key.to_string(), value);
    }
    Ok(Value::Object(prefs).to_string())
}

/// Resolve the local hostname, falling back to "unknown".
pub fn resolve_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
