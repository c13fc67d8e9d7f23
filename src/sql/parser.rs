//! Text protocol of the database CLI
//!
//! `QZDFMDB2` in interactive mode prints each result set as a header line, a
//! line of dashes giving the column widths, fixed-width rows and a trailing
//! record count. Errors arrive on stdout as a `**** CLI ERROR *****` block
//! whose next line carries the SQLSTATE and whose fourth line the message.

use super::value::{sniff_number, DbRow, DbValue};
use crate::error::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;

static CL_COMPLETION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"COMMAND .+ COMPLETED WITH EXIT STATUS \d+").unwrap());

const CLI_ERROR: &str = "**** CLI ERROR *****";

struct Column {
    name: String,
    from: usize,
    length: usize,
}

/// Parse CLI stdout into rows. A diagnostic block whose SQLSTATE is not a
/// warning (`01xxx`) becomes an [`AppError::Sql`].
pub fn db2_parse(output: &str) -> AppResult<Vec<DbRow>> {
    let mut data: Vec<&str> = output
        .split('\n')
        .filter(|line| {
            let trimmed = line.trim();
            trimmed != "DB2>" && trimmed != "?>" && !trimmed.starts_with("DB20") && !CL_COMPLETION.is_match(trimmed)
        })
        .collect();

    if data.last().map_or(false, |line| line.is_empty()) {
        data.pop();
    }

    let mut columns: Vec<Column> = vec![];
    let mut got_headers = false;
    let mut figured_lengths = false;
    let mut in_error_message = false;
    let mut rows = vec![];

    for (index, line) in data.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() && in_error_message {
            in_error_message = false;
        }
        if trimmed.is_empty() || index == data.len() - 1 {
            continue;
        }

        if trimmed == CLI_ERROR {
            in_error_message = true;
            if data.len() > index + 3 {
                let mut sqlstate = data[index + 1].trim();
                if let Some((_, state)) = sqlstate.split_once(':') {
                    sqlstate = state.trim();
                }

                if !sqlstate.starts_with("01") {
                    let message = match data[index + 3].trim() {
                        "" => "Unknown error",
                        text => text,
                    };
                    return Err(AppError::sql(
                        format!("{} ({})", message, sqlstate),
                        Some(sqlstate.to_string()),
                    ));
                }
            }
            continue;
        }

        if in_error_message {
            continue;
        }

        if !got_headers {
            columns = line
                .split(' ')
                .filter(|name| !name.is_empty())
                .map(|name| Column {
                    name: name.to_string(),
                    from: 0,
                    length: 0,
                })
                .collect();
            got_headers = true;
        } else if !figured_lengths {
            let mut base = 0;
            for (i, dashes) in line.split(' ').enumerate() {
                let width = dashes.chars().count();
                if let Some(column) = columns.get_mut(i) {
                    column.from = base;
                    column.length = width;
                }
                base += width + 1;
            }
            figured_lengths = true;
        } else {
            let row: DbRow = columns
                .iter()
                .map(|column| {
                    let raw: String = line.chars().skip(column.from).take(column.length).collect();
                    (column.name.clone(), cell_value(raw.trim_end()))
                })
                .collect();
            rows.push(row);
        }
    }

    Ok(rows)
}

fn cell_value(text: &str) -> DbValue {
    if text.starts_with(' ') {
        if let Some(number) = sniff_number(text.trim()) {
            return DbValue::Number(number);
        }
    } else if text == "-" {
        return DbValue::Null;
    }
    DbValue::Text(text.to_string())
}

/// Quote state while scanning SQL text: `'` opens a string literal and `"`
/// a delimited identifier; neither counts inside the other.
#[derive(Default)]
struct QuoteState {
    in_literal: bool,
    in_identifier: bool,
}

impl QuoteState {
    fn feed(&mut self, c: char) {
        match c {
            '\'' if !self.in_identifier => self.in_literal = !self.in_literal,
            '"' if !self.in_literal => self.in_identifier = !self.in_identifier,
            _ => {}
        }
    }

    fn quoted(&self) -> bool {
        self.in_literal || self.in_identifier
    }
}

/// Byte offset of the first `--` outside quotes
fn comment_start(line: &str) -> Option<usize> {
    let mut quotes = QuoteState::default();
    let mut previous_dash = false;
    for (index, c) in line.char_indices() {
        if c == '-' && !quotes.quoted() {
            if previous_dash {
                return Some(index - 1);
            }
            previous_dash = true;
            continue;
        }
        previous_dash = false;
        quotes.feed(c);
    }
    None
}

/// Prepare a script for the CLI: lines starting with `@` are CL commands and
/// are wrapped in `QCMDEXC`, and a `--` comment moves to its own line so it
/// cannot swallow the rest of a joined statement.
pub fn fix_sql(statement: &str, remove_comments: bool) -> String {
    let fixed = statement
        .split('\n')
        .map(|line| {
            let line = match line.strip_prefix('@') {
                Some(command) => {
                    let command = command.strip_suffix(';').unwrap_or(command);
                    format!("Call QSYS2.QCMDEXC('{}');", command.replace('\'', "''"))
                }
                None => line.to_string(),
            };
            match comment_start(&line) {
                Some(start) => format!("{}\n{}", &line[..start], &line[start..]),
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    if remove_comments {
        fixed
            .split('\n')
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        fixed
    }
}

/// Split a script on `;` outside of string literals and delimited
/// identifiers, dropping blank statements
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = vec![];
    let mut current = String::new();
    let mut quotes = QuoteState::default();

    for c in script.chars() {
        if c == ';' && !quotes.quoted() {
            statements.push(std::mem::take(&mut current));
            continue;
        }
        quotes.feed(c);
        current.push(c);
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows() {
        let output = format!(
            "DB2>\nSYSTEM_VALUE_NAME CURRENT_NUMERIC_VALUE\n{} {}\n{:<17} {:>21}\n\n  1 RECORD(S) SELECTED.\n\nDB2>",
            "-".repeat(17),
            "-".repeat(21),
            "QCCSID",
            37
        );
        let rows = db2_parse(&output).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["SYSTEM_VALUE_NAME"], DbValue::Text("QCCSID".to_string()));
        assert_eq!(rows[0]["CURRENT_NUMERIC_VALUE"], DbValue::Number(37.0));
    }

    #[test]
    fn test_parse_null_and_text() {
        let output = "A     B\n----- -----\nX     -\nYY    Z\n  2 RECORD(S) SELECTED.";
        let rows = db2_parse(output).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["B"], DbValue::Null);
        assert_eq!(rows[1]["A"], DbValue::Text("YY".to_string()));
    }

    #[test]
    fn test_parse_error_block() {
        let output = "DB2>\n **** CLI ERROR *****\n         SQLSTATE: 42704\nNATIVE ERROR CODE: -204\nFOO in QSYS2 type *FILE not found.\n\nDB2>";
        let err = db2_parse(output).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42704"));
        assert_eq!(err.to_string(), "FOO in QSYS2 type *FILE not found. (42704)");
    }

    #[test]
    fn test_parse_warning_is_not_an_error() {
        let output = " **** CLI ERROR *****\n         SQLSTATE: 01504\nNATIVE ERROR CODE: 7954\nUpdate applies to all rows.\n\nDONE\n";
        assert!(db2_parse(output).unwrap().is_empty());
    }

    #[test]
    fn test_parse_skips_notices_and_cl_output() {
        let output = "DB20000I  THE SQL COMMAND COMPLETED SUCCESSFULLY.\nCOMMAND CHGJOB COMPLETED WITH EXIT STATUS 0\nN\n-\n1\n  1 RECORD(S) SELECTED.";
        let rows = db2_parse(output).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["N"], DbValue::Text("1".to_string()));
    }

    #[test]
    fn test_fix_sql() {
        assert_eq!(
            fix_sql("Select * From MYTABLE -- This is a comment", false),
            "Select * From MYTABLE \n-- This is a comment"
        );
        assert_eq!(
            fix_sql(
                "@COMMAND LIB(QTEMP/*ALL) TEXT('Hello!');\nSelect * From QTEMP.MYTABLE -- This is mytable",
                false
            ),
            "Call QSYS2.QCMDEXC('COMMAND LIB(QTEMP/*ALL) TEXT(''Hello!'')');\nSelect * From QTEMP.MYTABLE \n-- This is mytable"
        );
        assert_eq!(fix_sql("select 1 from x -- c", true), "select 1 from x ");
    }

    #[test]
    fn test_split_statements_respects_literals() {
        let statements = split_statements("values 'a;b';\n select 1 from x;;");
        assert_eq!(statements, vec!["values 'a;b'", "select 1 from x"]);
    }

    #[test]
    fn test_split_statements_respects_delimited_identifiers() {
        assert_eq!(split_statements(r#"select "A;B" from x"#), vec![r#"select "A;B" from x"#]);
        assert_eq!(
            split_statements(r#"values 'x"y;z'; select "it's;" from x"#),
            vec![r#"values 'x"y;z'"#, r#"select "it's;" from x"#]
        );
    }

    #[test]
    fn test_fix_sql_keeps_dashes_inside_quotes() {
        assert_eq!(fix_sql("select 'a--b' from x", true), "select 'a--b' from x");
        assert_eq!(fix_sql(r#"select "A--B" from x -- note"#, true), r#"select "A--B" from x "#);
    }
}
