use super::{
    install_sql_source, installed_routine_version, Component, ComponentContext, ComponentIdentification,
    ComponentState,
};
use crate::error::AppResult;
use crate::sql::SqlEngine;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

const PROCEDURE: &str = "GETNEWLIBL";

/// Library list a CL command leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLibraryList {
    pub current_library: String,
    pub library_list: Vec<String>,
}

/// SQL procedure that runs a CL command and returns the resulting library list
pub struct GetNewLibl {
    temp_library: RwLock<String>,
    installed_version: RwLock<u32>,
}

impl GetNewLibl {
    pub const ID: &'static str = "GetNewLibl";
    pub const VERSION: u32 = 1;

    pub fn new(temp_library: impl Into<String>) -> Self {
        Self {
            temp_library: RwLock::new(temp_library.into()),
            installed_version: RwLock::new(0),
        }
    }

    /// The temp library can change during the handshake
    pub fn set_temp_library(&self, library: &str) {
        *self.temp_library.write() = library.to_string();
    }

    pub fn installed_version(&self) -> u32 {
        *self.installed_version.read()
    }

    fn source(&self) -> String {
        let library = self.temp_library.read().clone();
        [
            format!("CREATE OR REPLACE PROCEDURE {}.{}(IN COMMAND VARCHAR(2000))", library, PROCEDURE),
            "DYNAMIC RESULT SETS 1 ".to_string(),
            "BEGIN".to_string(),
            "  DECLARE clibl CURSOR FOR ".to_string(),
            "    SELECT ORDINAL_POSITION, TYPE as PORTION, SYSTEM_SCHEMA_NAME".to_string(),
            "    FROM QSYS2.LIBRARY_LIST_INFO;".to_string(),
            "  CALL QSYS2.QCMDEXC(COMMAND);".to_string(),
            "  OPEN clibl;".to_string(),
            "END;".to_string(),
            String::new(),
            format!(
                "comment on procedure {}.{} is '{} - Validate member information';",
                library,
                PROCEDURE,
                Self::VERSION
            ),
            String::new(),
            format!(
                "call QSYS2.QCMDEXC( 'grtobjaut {}/{} *PGM *PUBLIC *ALL' );",
                library, PROCEDURE
            ),
        ]
        .join("\n")
    }

    /// Run `command` and report the library list it produced
    pub fn library_list_from_command(&self, sql: &SqlEngine, command: &str) -> AppResult<CommandLibraryList> {
        let library = self.temp_library.read().clone();
        let rows = sql.query(&format!(
            "CALL {}.{}('{}')",
            library,
            PROCEDURE,
            command.replace('\'', "''")
        ))?;

        let mut result = CommandLibraryList {
            current_library: "QGPL".to_string(),
            library_list: vec![],
        };

        for row in rows {
            let name = row
                .get("SYSTEM_SCHEMA_NAME")
                .map(|v| v.to_string())
                .unwrap_or_default();
            match row.get("PORTION").and_then(|v| v.as_str()) {
                Some("CURRENT") => result.current_library = name,
                Some("USER") => result.library_list.push(name),
                _ => {}
            }
        }

        Ok(result)
    }
}

impl Component for GetNewLibl {
    fn identification(&self) -> ComponentIdentification {
        ComponentIdentification::new(Self::ID, Self::VERSION)
    }

    fn remote_state(&self, context: &ComponentContext<'_>, _install_directory: &str) -> AppResult<ComponentState> {
        let library = self.temp_library.read().clone();
        let version = installed_routine_version(context.sql, "sysprocs", &library, PROCEDURE)?;
        *self.installed_version.write() = version;

        if version < Self::VERSION {
            Ok(ComponentState::NeedsUpdate)
        } else {
            Ok(ComponentState::Installed)
        }
    }

    fn update(&self, context: &ComponentContext<'_>, _install_directory: &str) -> AppResult<ComponentState> {
        let state = install_sql_source(context.channel, "getnewlibl.sql", &self.source())?;
        if state == ComponentState::Installed {
            *self.installed_version.write() = Self::VERSION;
        }
        Ok(state)
    }

    fn reset(&self) {
        *self.installed_version.write() = 0;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandChannel, ShellContext};
    use crate::ssh::testing::ScriptedTransport;

    fn engine(transport: Arc<ScriptedTransport>) -> SqlEngine {
        let channel = Arc::new(CommandChannel::new(
            transport,
            ShellContext {
                temp_dir: "/tmp".to_string(),
                ..Default::default()
            },
            None,
        ));
        let sql = SqlEngine::new(channel);
        sql.update_environment(|e| {
            e.db2_path = Some("/QSYS.LIB/QZDFMDB2.PGM".to_string());
            e.enabled = true;
        });
        sql
    }

    #[test]
    fn test_needs_update_without_comment() {
        let transport = ScriptedTransport::new();
        transport.on("routine_name = 'GETNEWLIBL'", 0, "LONG_COMMENT\n------------\n  0 RECORD(S) SELECTED.", "");
        let sql = engine(transport);
        let component = GetNewLibl::new("ILEDITOR");
        let context = ComponentContext { channel: sql.channel(), sql: &sql };
        assert_eq!(component.remote_state(&context, "").unwrap(), ComponentState::NeedsUpdate);
    }

    #[test]
    fn test_installed_with_current_comment() {
        let transport = ScriptedTransport::new();
        transport.on(
            "routine_name = 'GETNEWLIBL'",
            0,
            "LONG_COMMENT\n-------------------------------\n1 - Validate member information\n  1 RECORD(S) SELECTED.",
            "",
        );
        let sql = engine(transport.clone());
        let component = GetNewLibl::new("ILEDITOR");
        let context = ComponentContext { channel: sql.channel(), sql: &sql };
        assert_eq!(component.remote_state(&context, "").unwrap(), ComponentState::Installed);
        assert!(transport.ran("routine_schema = 'ILEDITOR'"));
        assert_eq!(component.installed_version(), 1);
    }

    #[test]
    fn test_update_runs_runsqlstm() {
        let transport = ScriptedTransport::new();
        let sql = engine(transport.clone());
        let component = GetNewLibl::new("ILEDITOR");
        let context = ComponentContext { channel: sql.channel(), sql: &sql };

        assert_eq!(component.update(&context, "").unwrap(), ComponentState::Installed);
        assert!(transport.ran("RUNSQLSTM SRCSTMF('/tmp/ibmitemp-O_"));
        let call = transport
            .calls()
            .into_iter()
            .find(|c| c.stdin.as_deref().map_or(false, |s| s.contains("RUNSQLSTM")))
            .unwrap();
        assert_eq!(call.cwd.as_deref(), Some("/"));
        assert!(!call.stdin.unwrap().contains("liblist"));
    }

    #[test]
    fn test_update_failure_is_error_state() {
        let transport = ScriptedTransport::new();
        transport.on("RUNSQLSTM", 1, "", "SQL9010: RUNSQLSTM command failed.");
        let sql = engine(transport);
        let component = GetNewLibl::new("ILEDITOR");
        let context = ComponentContext { channel: sql.channel(), sql: &sql };
        assert_eq!(component.update(&context, "").unwrap(), ComponentState::Error);
    }

    #[test]
    fn test_library_list_from_command() {
        let transport = ScriptedTransport::new();
        transport.on(
            "GETNEWLIBL('CHGLIBL LIBL(A B) CURLIB(''C'')')",
            0,
            &format!(
                "{:<16} {:<7} {:<18}\n{} {} {}\n{:>16} {:<7} {:<18}\n{:>16} {:<7} {:<18}\n{:>16} {:<7} {:<18}\n  3 RECORD(S) SELECTED.",
                "ORDINAL_POSITION", "PORTION", "SYSTEM_SCHEMA_NAME",
                "-".repeat(16), "-".repeat(7), "-".repeat(18),
                1, "SYSTEM", "QSYS",
                2, "CURRENT", "C",
                3, "USER", "A"
            ),
            "",
        );
        let sql = engine(transport);
        let component = GetNewLibl::new("ILEDITOR");
        let result = component
            .library_list_from_command(&sql, "CHGLIBL LIBL(A B) CURLIB('C')")
            .unwrap();
        assert_eq!(result.current_library, "C");
        assert_eq!(result.library_list, vec!["A".to_string()]);
    }
}
