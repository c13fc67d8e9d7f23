//! Remote components
//!
//! Small helpers that live on the host (a fast shell binary, SQL procedures)
//! and are installed or upgraded on demand. Each component reports its remote
//! state and knows how to bring itself up to date; the manager drives the
//! state machine once per session.

pub mod fast_shell;
pub mod get_new_libl;
pub mod manager;
pub mod sql_to_csv;

pub use fast_shell::*;
pub use get_new_libl::*;
pub use manager::*;
pub use sql_to_csv::*;

use crate::command::{CommandChannel, CommandData, CommandEnvironment, RemoteCommand};
use crate::error::AppResult;
use crate::sql::SqlEngine;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a component on one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentState {
    #[default]
    NotChecked,
    NotInstalled,
    Installed,
    NeedsUpdate,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentIdentification {
    pub name: String,
    pub version: u32,
}

impl ComponentIdentification {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ComponentIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (version {})", self.name, self.version)
    }
}

/// Persisted record of a component's last known state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInstallState {
    pub id: ComponentIdentification,
    pub state: ComponentState,
}

/// What a component may use while probing or updating
pub struct ComponentContext<'a> {
    pub channel: &'a CommandChannel,
    pub sql: &'a SqlEngine,
}

pub trait Component: Send + Sync {
    fn identification(&self) -> ComponentIdentification;

    /// Called before a cached state is trusted, so path-based components
    /// still know where they live
    fn set_install_directory(&self, _install_directory: &str) {}

    fn remote_state(&self, context: &ComponentContext<'_>, install_directory: &str) -> AppResult<ComponentState>;

    /// Install or upgrade; returns the resulting state
    fn update(&self, context: &ComponentContext<'_>, install_directory: &str) -> AppResult<ComponentState>;

    /// Forget everything learned on a previous connection
    fn reset(&self) {}

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Version embedded in a routine comment (`"2 - Produce a CSV file ..."`)
pub fn parse_version_comment(comment: &str) -> Option<u32> {
    let (version, _) = comment.split_once('-')?;
    version.trim().parse().ok()
}

/// Version of an SQL routine in `schema`, read from its catalog comment
pub fn installed_routine_version(sql: &SqlEngine, catalog: &str, schema: &str, routine: &str) -> AppResult<u32> {
    let rows = sql.query(&format!(
        "select cast(LONG_COMMENT as VarChar(200)) LONG_COMMENT from qsys2.{} where routine_schema = '{}' and routine_name = '{}'",
        catalog,
        schema.to_uppercase(),
        routine
    ))?;

    Ok(rows
        .first()
        .and_then(|row| row.get("LONG_COMMENT"))
        .and_then(|comment| parse_version_comment(&comment.to_string()))
        .unwrap_or(0))
}

/// Write `source` to a temporary stream file and run it with RUNSQLSTM
pub fn install_sql_source(channel: &CommandChannel, file_name: &str, source: &str) -> AppResult<ComponentState> {
    channel.with_temp_directory(|temp_dir| {
        let source_path = format!("{}/{}", temp_dir, file_name);
        channel.write_text(&source_path, source)?;

        let mut command = RemoteCommand::new(
            CommandEnvironment::Ile,
            format!("RUNSQLSTM SRCSTMF('{}') COMMIT(*NONE) NAMING(*SQL)", source_path),
        );
        command.cwd = Some("/".to_string());
        command.no_lib_list = true;

        let result = channel.run_command(&command)?;
        if result.code == 0 {
            Ok(ComponentState::Installed)
        } else {
            tracing::warn!("RUNSQLSTM for {} failed: {}", file_name, result.stderr);
            Ok(ComponentState::Error)
        }
    })
}

/// `test -<mode> <path>` succeeded
pub fn test_stream_file(channel: &CommandChannel, path: &str, mode: char) -> AppResult<bool> {
    let result = channel.send_command(&CommandData::new(format!("test -{} {}", mode, path)))?;
    Ok(result.code == 0)
}
