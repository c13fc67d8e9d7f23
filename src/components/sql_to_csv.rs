use super::{
    install_sql_source, installed_routine_version, Component, ComponentContext, ComponentIdentification,
    ComponentState,
};
use crate::command::{make_id, TEMP_FILE_PREFIX};
use crate::error::AppResult;
use crate::sql::{CsvExport, CsvWrap};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

const PROCEDURE: &str = "SQL_TO_CSV";

/// SQL procedure that runs a query and writes its rows to a UTF-8 CSV
/// stream file. Used by the SQL engine when inline output is unsafe.
pub struct SqlToCsv {
    temp_library: RwLock<String>,
    temp_dir: RwLock<String>,
}

impl SqlToCsv {
    pub const ID: &'static str = "SqlToCsv";
    pub const VERSION: u32 = 2;

    pub fn new(temp_library: impl Into<String>, temp_dir: impl Into<String>) -> Self {
        Self {
            temp_library: RwLock::new(temp_library.into()),
            temp_dir: RwLock::new(temp_dir.into()),
        }
    }

    pub fn set_temp_locations(&self, library: &str, directory: &str) {
        *self.temp_library.write() = library.to_string();
        *self.temp_dir.write() = directory.to_string();
    }

    fn source(&self) -> String {
        let library = self.temp_library.read().clone();
        format!(
            r#"create or replace procedure {library}.sql_to_csv
(
    in sql_statement    clob,
    in output_file      varchar(256)
)
language sql
modifies SQL data
  set option dbgview = *source , output=*print , commit=*none, datfmt=*iso
begin atomic

    declare sqlcode  int default 0;
    declare cols     int;
    declare colNo    int;
    declare colType  int;
    declare colName  varchar(256);
    declare colValue varchar(32000) ccsid 1208;
    declare newline  varchar(2) default ux'000A';
    declare comma    varchar(1) default '';
    declare file_content clob(16m) ccsid 1208 default '';

    declare c1 cursor for stmt;
    allocate descriptor local 'original' with max 256;
    allocate descriptor local 'modified' with max 256;

    prepare stmt from sql_statement;
    describe stmt using sql descriptor local 'original';
    describe stmt using sql descriptor local 'modified';

    open c1;
    get descriptor 'original' cols = count;

    set comma = '';
    set colNo = 1;
    while colNo <= cols do
        set descriptor 'modified' value colNo
              LENGTH = 32000,
              TYPE = 12,
              DB2_CCSID = 1208;

        get descriptor 'original' value colNo
            colName = NAME;

        set file_content = concat(file_content, comma || '"' || colName || '"');
        set comma = ',';
        set colNo = colNo + 1;
    end while;

    fetch c1 into sql descriptor 'modified';
    while sqlcode = 0 do
        set file_content = concat(file_content, newline);
        set comma = '';
        set colNo = 1;
        while colNo <= cols do
            get descriptor 'original' value colNo
                colType = TYPE;

            get descriptor 'modified' value colNo
                colValue = DATA;

            if colType in (1, 12) then
                set file_content = concat(file_content, comma || '"' || replace(trim(colValue), '"', '""') || '"');
            else
                set file_content = concat(file_content, comma || trim(colValue));
            end if;
            set comma = ',';
            set colNo = colNo + 1;
        end while;
        fetch c1 into sql descriptor 'modified';
    end while;

    close c1;
    deallocate descriptor local 'modified';
    deallocate descriptor local 'original';

    call qsys2.ifs_write_utf8(output_file, file_content, overwrite => 'REPLACE', end_of_line => 'LF');
end;

comment on procedure {library}.sql_to_csv is '{version} - Produce a CSV file from a SQL statement';
"#,
            library = library,
            version = Self::VERSION
        )
    }
}

impl Component for SqlToCsv {
    fn identification(&self) -> ComponentIdentification {
        ComponentIdentification::new(Self::ID, Self::VERSION)
    }

    fn remote_state(&self, context: &ComponentContext<'_>, _install_directory: &str) -> AppResult<ComponentState> {
        let library = self.temp_library.read().clone();
        let version = installed_routine_version(context.sql, "sysroutines", &library, PROCEDURE)?;

        Ok(match version {
            0 => ComponentState::NotInstalled,
            v if v == Self::VERSION => ComponentState::Installed,
            _ => ComponentState::NeedsUpdate,
        })
    }

    fn update(&self, context: &ComponentContext<'_>, _install_directory: &str) -> AppResult<ComponentState> {
        install_sql_source(context.channel, "sqltocsv.sql", &self.source())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl CsvExport for SqlToCsv {
    fn wrap(&self, statement: &str) -> AppResult<CsvWrap> {
        let statement = statement.trim();
        let statement = statement.strip_suffix(';').unwrap_or(statement);

        let output_file = format!(
            "{}/{}{}.csv",
            self.temp_dir.read().trim_end_matches('/'),
            TEMP_FILE_PREFIX,
            make_id(8)
        );

        Ok(CsvWrap {
            statements: vec![format!(
                "CALL {}.{}('{}', '{}')",
                self.temp_library.read(),
                PROCEDURE,
                statement.replace('\'', "''"),
                output_file
            )],
            output_file,
        })
    }
}
