//! SSH transport
//!
//! A single authenticated ssh2 session per connection. Every command runs on
//! its own exec channel; files move over SFTP on the same session.

pub mod monitor;
pub mod session;
#[cfg(test)]
pub mod testing;

pub use monitor::*;
pub use session::*;

use crate::error::AppResult;
use serde::{Deserialize, Serialize};

/// Authentication method. Secrets are looked up by connection name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Key,
    Agent,
}

/// What to do with a host key that is not in known_hosts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownHostsPolicy {
    /// Reject unknown hosts
    #[default]
    Strict,
    /// Ask the callbacks
    Ask,
    /// Trust and record
    Accept,
}

/// One remote command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    /// Directory to `cd` into first. A failing `cd` does not stop the command.
    pub cwd: Option<String>,
    pub stdin: Option<String>,
}

/// Raw result from the transport; the exit code may be missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// The one connection every other part of the session talks through
pub trait Transport: Send + Sync {
    fn exec(&self, request: &ExecRequest) -> AppResult<ExecOutput>;
    fn download(&self, remote_path: &str) -> AppResult<Vec<u8>>;
    fn upload(&self, remote_path: &str, contents: &[u8]) -> AppResult<()>;
    fn keepalive(&self) -> AppResult<()>;
    fn is_connected(&self) -> bool;
    fn close(&self);
}

/// Wrap a command so it runs inside `cwd`. Mirrors what interactive SSH
/// clients do: the command still runs when the directory is missing.
pub fn with_directory(command: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) if !dir.is_empty() => format!("cd '{}' ; {}", dir.replace('\'', "'\\''"), command),
        _ => command.to_string(),
    }
}
