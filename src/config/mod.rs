//! Server configuration
//!
//! The serve command reads an optional TOML file and merges CLI flags on
//! top. Paths support environment variable and tilde expansion.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::path::expand_path;

/// On-disk configuration for `termshare serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Address the routing proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Unix socket of the local in-process SSHD host legs are routed to.
    #[serde(default = "default_sshd_socket")]
    pub sshd_socket: String,

    /// Directory holding per-session reverse-tunnel sockets.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,

    /// Host key files. An ephemeral key is generated when empty.
    #[serde(default)]
    pub host_keys: Vec<String>,

    /// Whether upstreams are peer server nodes instead of host SSHDs.
    #[serde(default)]
    pub upstream_node: bool,

    /// Grace period for in-flight connections on shutdown, e.g. "2s".
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sshd_socket: default_sshd_socket(),
            sessions_dir: default_sessions_dir(),
            host_keys: Vec::new(),
            upstream_node: false,
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:2222".to_string()
}

fn default_sshd_socket() -> String {
    "$XDG_RUNTIME_DIR/termshare/sshd.sock".to_string()
}

fn default_sessions_dir() -> String {
    "$XDG_RUNTIME_DIR/termshare/sessions".to_string()
}

fn default_drain_timeout() -> String {
    "2s".to_string()
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Expand environment variables and tilde in all paths and parse
    /// duration strings.
    pub fn expand(&self) -> crate::Result<ExpandedConfig> {
        Ok(ExpandedConfig {
            listen: self.listen.clone(),
            sshd_socket: PathBuf::from(expand_path(&self.sshd_socket)?),
            sessions_dir: PathBuf::from(expand_path(&self.sessions_dir)?),
            host_keys: self
                .host_keys
                .iter()
                .map(|p| expand_path(p).map(PathBuf::from))
                .collect::<crate::Result<_>>()?,
            upstream_node: self.upstream_node,
            drain_timeout: parse_duration(&self.drain_timeout)?,
        })
    }
}

/// Configuration with paths expanded and durations parsed.
#[derive(Debug, Clone)]
pub struct ExpandedConfig {
    pub listen: String,
    pub sshd_socket: PathBuf,
    pub sessions_dir: PathBuf,
    pub host_keys: Vec<PathBuf>,
    pub upstream_node: bool,
    pub drain_timeout: Duration,
}

/// Parse a duration string like "2s", "500ms", "1m"
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::Config("empty duration string".to_string()));
    }

    let (num_str, unit) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, "s"));

    let num: u64 = num_str.trim().parse().map_err(|e| {
        crate::Error::Config(format!("invalid duration number '{}': {}", num_str, e))
    })?;

    let duration = match unit.to_lowercase().as_str() {
        "ms" | "millis" | "milliseconds" => Duration::from_millis(num),
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(num),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(num * 60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs(num * 60 * 60),
        _ => {
            return Err(crate::Error::Config(format!(
                "unknown duration unit '{}' in '{}'",
                unit, s
            )));
        }
    };

    Ok(duration)
}
