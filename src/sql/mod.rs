//! SQL over the database CLI
//!
//! Scripts are piped into `QZDFMDB2` through the command channel and the
//! textual result is parsed into rows. Queries whose data cannot cross the
//! interactive stream safely are spooled to a CSV stream file instead.

pub mod export;
pub mod parser;
pub mod value;

pub use export::*;
pub use parser::*;
pub use value::*;

use crate::command::{CommandChannel, CommandData};
use crate::encoding::{CcsidInfo, CCSID_NOCONVERSION};
use crate::error::{AppError, AppResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote feature name of the database CLI
pub const DB2_FEATURE: &str = "QZDFMDB2.PGM";

const DB2_COMMAND: &str = "system \"call QSYS/QZDFMDB2 PARM('-d' '-i' '-t')\"";

#[derive(Debug, Clone, Default)]
pub struct SqlOptions {
    /// Values for the `?` placeholders of the final statement
    pub fake_bindings: Vec<BindingValue>,
    /// Always route a final query through the CSV side channel
    pub force_safe: bool,
}

/// What the handshake learned that decides how SQL is run
#[derive(Debug, Clone, Default)]
pub struct SqlEnvironment {
    /// Path of the CLI program, when present
    pub db2_path: Option<String>,
    pub enabled: bool,
    pub ccsid: CcsidInfo,
    /// Inline output would be mistranslated
    pub requires_translation: bool,
}

impl SqlEnvironment {
    fn requires_safe_path(&self) -> bool {
        self.requires_translation || self.ccsid.qccsid == CCSID_NOCONVERSION
    }
}

pub struct SqlEngine {
    channel: Arc<CommandChannel>,
    environment: RwLock<SqlEnvironment>,
}

impl SqlEngine {
    pub fn new(channel: Arc<CommandChannel>) -> Self {
        Self {
            channel,
            environment: RwLock::new(SqlEnvironment::default()),
        }
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn environment(&self) -> SqlEnvironment {
        self.environment.read().clone()
    }

    pub fn update_environment(&self, update: impl FnOnce(&mut SqlEnvironment)) {
        update(&mut self.environment.write());
    }

    /// The CLI exists and SQL has not been switched off
    pub fn is_available(&self) -> bool {
        let environment = self.environment.read();
        environment.enabled && environment.db2_path.is_some()
    }

    /// Run a script and return the rows of its final statement
    pub fn run_sql(
        &self,
        statements: &str,
        options: &SqlOptions,
        csv: Option<&dyn CsvExport>,
    ) -> AppResult<Vec<DbRow>> {
        let environment = self.environment();
        if environment.db2_path.is_none() {
            return Err(AppError::FeatureUnavailable(
                "There is no way to run SQL on this system.".to_string(),
            ));
        }

        let job_fix = environment
            .ccsid
            .job_fix_ccsid()
            .map(|ccsid| format!("@CHGJOB CCSID({});\n", ccsid))
            .unwrap_or_default();

        let fixed = fix_sql(&format!("{}{}", job_fix, statements), true);
        let mut list = split_statements(&fixed.split('\n').collect::<Vec<_>>().join(" "));
        let Some(last) = list.pop() else {
            return Ok(vec![]);
        };

        let last = if options.fake_bindings.is_empty() {
            last
        } else {
            apply_fake_bindings(&last, &options.fake_bindings)
        };

        let upper = last.to_uppercase();
        let is_query = upper.starts_with("SELECT") || upper.starts_with("WITH");
        let mut csv_file = None;

        if is_query && (options.force_safe || environment.requires_safe_path()) {
            match csv {
                Some(export) => {
                    let wrap = export.wrap(&last)?;
                    list.extend(wrap.statements);
                    csv_file = Some(wrap.output_file);
                }
                None => {
                    warn!("CSV export is not installed, running query inline");
                    list.push(last);
                }
            }
        } else {
            list.push(last);
        }

        list.push(String::new());
        let input = list.join(";\n");

        let command = match self.channel.context().fast_shell {
            Some(helper) => format!("{} -c \"{}\"", helper, DB2_COMMAND.replace('"', "\\\"")),
            None => format!("LC_ALL=EN_US.UTF-8 {}", DB2_COMMAND),
        };

        let output = self
            .channel
            .send_command(&CommandData::new(command).with_stdin(input))?;

        if output.stdout.is_empty() {
            return Err(AppError::sql("There was an error running the SQL statement.", None));
        }

        let rows = db2_parse(&output.stdout)?;

        match csv_file {
            Some(file) => {
                debug!("Reading result set from {}", file);
                let content = self.channel.download(&file)?;
                if let Err(e) = self
                    .channel
                    .send_command(&CommandData::new(format!("rm -f \"{}\"", file)))
                {
                    warn!("Could not remove {}: {}", file, e);
                }
                parse_csv(&content)
            }
            None => Ok(rows),
        }
    }

    /// Convenience for a single statement with no options
    pub fn query(&self, statement: &str) -> AppResult<Vec<DbRow>> {
        self.run_sql(statement, &SqlOptions::default(), None)
    }
}

/// Substitute bindings positionally for `?`. Extra placeholders stay empty.
pub fn apply_fake_bindings(statement: &str, bindings: &[BindingValue]) -> String {
    let mut result = String::with_capacity(statement.len());
    for (index, part) in statement.split('?').enumerate() {
        result.push_str(part);
        if let Some(binding) = bindings.get(index) {
            result.push_str(&binding.to_sql_literal());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellContext;
    use crate::ssh::testing::ScriptedTransport;

    struct FakeExport;

    impl CsvExport for FakeExport {
        fn wrap(&self, statement: &str) -> AppResult<CsvWrap> {
            Ok(CsvWrap {
                statements: vec![format!("CALL ILEDITOR.SQL_TO_CSV('{}', '/tmp/out.csv')", statement.replace('\'', "''"))],
                output_file: "/tmp/out.csv".to_string(),
            })
        }
    }

    fn engine(transport: Arc<ScriptedTransport>) -> SqlEngine {
        let channel = Arc::new(CommandChannel::new(transport, ShellContext::default(), None));
        let engine = SqlEngine::new(channel);
        engine.update_environment(|e| {
            e.db2_path = Some("/QSYS.LIB/QZDFMDB2.PGM".to_string());
            e.enabled = true;
        });
        engine
    }

    const ONE_ROW: &str = "N\n-\nA\n  1 RECORD(S) SELECTED.";

    #[test]
    fn test_missing_cli_is_a_hard_error() {
        let channel = Arc::new(CommandChannel::new(ScriptedTransport::new(), ShellContext::default(), None));
        let engine = SqlEngine::new(channel);
        let err = engine.query("values 1").unwrap_err();
        assert!(matches!(err, AppError::FeatureUnavailable(_)));
    }

    #[test]
    fn test_inline_query() {
        let transport = ScriptedTransport::new();
        transport.on("QZDFMDB2", 0, ONE_ROW, "");
        let engine = engine(transport.clone());
        let rows = engine.query("select 'A' as N from sysibm.sysdummy1").unwrap();
        assert_eq!(rows[0]["N"], DbValue::Text("A".to_string()));

        let call = &transport.calls()[0];
        assert!(call.command.starts_with("LC_ALL=EN_US.UTF-8 system"));
        assert_eq!(call.stdin.as_deref(), Some("select 'A' as N from sysibm.sysdummy1;\n"));
    }

    #[test]
    fn test_empty_stdout_is_an_error() {
        let transport = ScriptedTransport::new();
        transport.on("QZDFMDB2", 0, "", "");
        let err = engine(transport).query("values 1").unwrap_err();
        assert_eq!(err.to_string(), "There was an error running the SQL statement.");
    }

    #[test]
    fn test_job_ccsid_fix_is_prepended() {
        let transport = ScriptedTransport::new();
        transport.on("QZDFMDB2", 0, ONE_ROW, "");
        let engine = engine(transport.clone());
        engine.update_environment(|e| {
            e.ccsid.job_ccsid = CCSID_NOCONVERSION;
            e.ccsid.user_default_ccsid = 37;
        });
        engine.query("values 1").unwrap();
        let stdin = transport.calls()[0].stdin.clone().unwrap();
        assert!(stdin.starts_with("Call QSYS2.QCMDEXC('CHGJOB CCSID(37)');\nvalues 1;"));
    }

    #[test]
    fn test_force_safe_routes_through_csv() {
        let transport = ScriptedTransport::new();
        transport.on("QZDFMDB2", 0, "DB20000I  THE SQL COMMAND COMPLETED SUCCESSFULLY.\nDONE", "");
        transport.put_file("/tmp/out.csv", b"\"N\"\n\"A\"\n");
        let engine = engine(transport.clone());

        let options = SqlOptions {
            force_safe: true,
            ..Default::default()
        };
        let rows = engine.run_sql("select 'A' as N from x", &options, Some(&FakeExport)).unwrap();
        assert_eq!(rows[0]["N"], DbValue::Text("A".to_string()));
        assert!(transport.ran("CALL ILEDITOR.SQL_TO_CSV('select ''A'' as N from x', '/tmp/out.csv')"));
        assert!(transport.ran("rm -f \"/tmp/out.csv\""));
    }

    #[test]
    fn test_non_query_never_uses_csv() {
        let transport = ScriptedTransport::new();
        transport.on("QZDFMDB2", 0, "DONE", "");
        let engine = engine(transport.clone());
        let options = SqlOptions {
            force_safe: true,
            ..Default::default()
        };
        engine.run_sql("delete from x", &options, Some(&FakeExport)).unwrap();
        assert!(!transport.ran("SQL_TO_CSV"));
    }

    #[test]
    fn test_sql_error_propagates() {
        let transport = ScriptedTransport::new();
        transport.on(
            "QZDFMDB2",
            0,
            " **** CLI ERROR *****\n  SQLSTATE: 42601\nNATIVE ERROR CODE: -104\nToken X was not valid.\n",
            "",
        );
        let err = engine(transport).query("select X X from").unwrap_err();
        assert_eq!(err.sqlstate(), Some("42601"));
    }

    #[test]
    fn test_fake_bindings() {
        let statement = apply_fake_bindings(
            "select * from t where a = ? and b = ?",
            &[BindingValue::from("Hi"), BindingValue::from(7)],
        );
        assert_eq!(statement, "select * from t where a = UX'00480069' and b = 7");
    }
}
