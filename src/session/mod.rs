//! Session orchestrator
//!
//! `Connection` opens the transport and runs the handshake; the result is a
//! ready `Session` that every other operation goes through. The handshake is
//! a fixed sequence of steps. Only the shell check is fatal, the other steps
//! degrade to a named warning reported through [`ConnectionCallbacks`].

pub mod asp;
pub mod callbacks;
pub mod connection;
pub mod debug;
pub mod features;
mod handshake;

pub use asp::*;
pub use callbacks::*;
pub use connection::*;
pub use debug::*;
pub use features::*;

use crate::command::{CommandChannel, CommandData, CommandResult, RemoteCommand};
use crate::components::{CommandLibraryList, ComponentManager, GetNewLibl, SqlToCsv};
use crate::config::ConnectionSettings;
use crate::encoding::{parse_member_path, CcsidInfo, MemberParts};
use crate::error::{AppError, AppResult};
use crate::sql::{CsvExport, DbRow, SqlEngine, SqlOptions};
use parking_lot::RwLock;
use std::sync::Arc;

/// Facts the handshake negotiated
#[derive(Debug, Clone, Default)]
pub struct SessionFacts {
    pub features: RemoteFeatureTable,
    /// `None` until the CCSIDs were fetched over SQL
    pub ccsid: Option<CcsidInfo>,
    pub requires_translation: bool,
    pub asps: Vec<AspInfo>,
    pub current_iasp: Option<String>,
    pub os_version: Option<String>,
    pub maximum_args_length: Option<u64>,
    pub debug_config: Option<DebugConfig>,
}

/// A connected, ready session
pub struct Session {
    name: String,
    channel: Arc<CommandChannel>,
    sql: SqlEngine,
    components: Arc<ComponentManager>,
    facts: RwLock<SessionFacts>,
    settings: RwLock<ConnectionSettings>,
}

impl Session {
    pub(crate) fn new(
        name: impl Into<String>,
        channel: Arc<CommandChannel>,
        components: Arc<ComponentManager>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            name: name.into(),
            sql: SqlEngine::new(channel.clone()),
            channel,
            components,
            facts: RwLock::new(SessionFacts::default()),
            settings: RwLock::new(settings),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn sql(&self) -> &SqlEngine {
        &self.sql
    }

    pub fn components(&self) -> &ComponentManager {
        &self.components
    }

    pub fn facts(&self) -> SessionFacts {
        self.facts.read().clone()
    }

    pub(crate) fn update_facts(&self, update: impl FnOnce(&mut SessionFacts)) {
        update(&mut self.facts.write());
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings.read().clone()
    }

    /// Change settings for the rest of the session. The library list and
    /// current library are pushed to the command channel as well.
    pub fn update_settings(&self, update: impl FnOnce(&mut ConnectionSettings)) {
        let settings = {
            let mut settings = self.settings.write();
            update(&mut settings);
            settings.clone()
        };
        self.channel.update_context(|context| {
            context.current_library = settings.current_library.clone();
            context.library_list = settings.library_list.clone();
            context.custom_variables = settings.custom_variables.clone();
        });
    }

    pub fn send_command(&self, data: &CommandData) -> AppResult<CommandResult> {
        self.channel.send_command(data)
    }

    pub fn send_qsh(&self, data: &CommandData) -> AppResult<CommandResult> {
        self.channel.send_qsh(data)
    }

    pub fn run_command(&self, command: &RemoteCommand) -> AppResult<CommandResult> {
        self.channel.run_command(command)
    }

    /// Run a script; queries that cannot cross the shell safely go through
    /// the CSV export component when it is installed
    pub fn run_sql(&self, statements: &str, options: &SqlOptions) -> AppResult<Vec<DbRow>> {
        if !self.sql.is_available() {
            return Err(AppError::FeatureUnavailable(
                "SQL is not enabled for this connection.".to_string(),
            ));
        }
        let export = self.components.get_as::<SqlToCsv>(SqlToCsv::ID, false);
        self.sql
            .run_sql(statements, options, export.as_deref().map(|e| e as &dyn CsvExport))
    }

    /// Library list and current library a CL command leaves behind
    pub fn library_list_from_command(&self, command: &str) -> AppResult<CommandLibraryList> {
        let component = self
            .components
            .get_as::<GetNewLibl>(GetNewLibl::ID, false)
            .ok_or_else(|| AppError::FeatureUnavailable(format!("{} is not installed", GetNewLibl::ID)))?;
        component.library_list_from_command(&self.sql, command)
    }

    pub fn all_iasps(&self) -> Vec<AspInfo> {
        self.facts.read().asps.clone()
    }

    pub fn get_iasp(&self, id: i64) -> Option<AspInfo> {
        find_by_id(&self.facts.read().asps, id).cloned()
    }

    pub fn get_iasp_by_name(&self, name: &str) -> Option<AspInfo> {
        find_by_name(&self.facts.read().asps, name).cloned()
    }

    /// iASP of the user's job, when it runs against one
    pub fn current_iasp(&self) -> Option<AspInfo> {
        let facts = self.facts.read();
        let name = facts.current_iasp.as_deref()?;
        find_by_name(&facts.asps, name).cloned()
    }

    /// Name of the iASP `library` lives in; `None` for the system ASP
    pub fn lookup_library_iasp(&self, library: &str) -> AppResult<Option<String>> {
        if !self.sql.is_available() {
            return Ok(None);
        }
        let library = self.to_american(&self.upper_case_name(library));
        let number = fetch_library_asp_number(&self.sql, &library)?;
        Ok(number.and_then(|id| self.get_iasp(id)).map(|asp| asp.name))
    }

    pub fn to_local(&self, text: &str) -> String {
        self.channel.context().variants.to_local(text)
    }

    pub fn to_american(&self, text: &str) -> String {
        self.channel.context().variants.to_american(text)
    }

    pub fn upper_case_name(&self, name: &str) -> String {
        self.channel.context().variants.upper_case_name(name)
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        self.channel.context().variants.is_valid_name(name)
    }

    pub fn parse_member_path(&self, path: &str, require_extension: bool) -> AppResult<MemberParts> {
        parse_member_path(&self.channel.context().variants, path, require_extension)
    }

    pub fn debug_config(&self) -> Option<DebugConfig> {
        self.facts.read().debug_config.clone()
    }
}
