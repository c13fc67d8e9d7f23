use crate::error::AppResult;
use crate::sql::{DbRow, SqlEngine};
use serde::{Deserialize, Serialize};

/// An independent auxiliary storage pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AspInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub asp_type: String,
    pub rdb_name: String,
}

pub fn parse_asp_rows(rows: &[DbRow]) -> Vec<AspInfo> {
    rows.iter()
        .filter_map(|row| {
            let name = row.get("DEVICE_DESCRIPTION_NAME").and_then(|v| v.as_str())?;
            if name.is_empty() || name == "null" {
                return None;
            }
            let text = |column: &str| row.get(column).map(|v| v.to_string()).unwrap_or_default();

            Some(AspInfo {
                id: row.get("ASP_NUMBER").and_then(|v| v.as_i64())?,
                name: name.to_string(),
                asp_type: text("ASP_TYPE"),
                rdb_name: text("RDB_NAME"),
            })
        })
        .collect()
}

pub fn fetch_asp_info(sql: &SqlEngine) -> AppResult<Vec<AspInfo>> {
    let rows = sql.query("SELECT * FROM QSYS2.ASP_INFO")?;
    Ok(parse_asp_rows(&rows))
}

/// iASP the job's database currently points at, matched by RDB name
pub fn fetch_current_iasp(sql: &SqlEngine, asps: &[AspInfo]) -> AppResult<Option<String>> {
    let rows = sql.query("values current_server")?;
    let server = rows
        .first()
        .and_then(|row| row.values().next())
        .map(|value| value.to_string());

    Ok(server.and_then(|server| {
        asps.iter()
            .find(|asp| asp.rdb_name.eq_ignore_ascii_case(&server))
            .map(|asp| asp.name.clone())
    }))
}

/// ASP number a library lives in; `None` for the system ASP
pub fn fetch_library_asp_number(sql: &SqlEngine, library: &str) -> AppResult<Option<i64>> {
    let rows = sql.query(&format!(
        "SELECT IASP_NUMBER FROM TABLE(QSYS2.LIBRARY_INFO('{}'))",
        library.replace('\'', "''")
    ))?;
    Ok(rows
        .first()
        .and_then(|row| row.get("IASP_NUMBER"))
        .and_then(|value| value.as_i64()))
}

pub fn find_by_id(asps: &[AspInfo], id: i64) -> Option<&AspInfo> {
    asps.iter().find(|asp| asp.id == id)
}

pub fn find_by_name<'a>(asps: &'a [AspInfo], name: &str) -> Option<&'a AspInfo> {
    asps.iter().find(|asp| asp.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::DbValue;

    fn row(number: f64, name: DbValue) -> DbRow {
        let mut row = DbRow::new();
        row.insert("ASP_NUMBER".to_string(), DbValue::Number(number));
        row.insert("DEVICE_DESCRIPTION_NAME".to_string(), name);
        row.insert("ASP_TYPE".to_string(), DbValue::Text("PRIMARY".to_string()));
        row.insert("RDB_NAME".to_string(), DbValue::Text("IASP1".to_string()));
        row
    }

    #[test]
    fn test_parse_skips_system_asp() {
        let rows = vec![
            row(1.0, DbValue::Null),
            row(144.0, DbValue::Text("IASP1".to_string())),
        ];
        let asps = parse_asp_rows(&rows);
        assert_eq!(asps.len(), 1);
        assert_eq!(asps[0].id, 144);
        assert_eq!(asps[0].asp_type, "PRIMARY");
        assert_eq!(find_by_id(&asps, 144).map(|a| a.name.as_str()), Some("IASP1"));
        assert!(find_by_name(&asps, "iasp1").is_some());
        assert!(find_by_id(&asps, 1).is_none());
    }

    #[test]
    fn test_serde_shape() {
        let asp = AspInfo {
            id: 144,
            name: "IASP1".to_string(),
            asp_type: "PRIMARY".to_string(),
            rdb_name: "IASP1".to_string(),
        };
        let json = serde_json::to_value(&asp).unwrap();
        assert_eq!(json["type"], "PRIMARY");
        assert_eq!(json["rdbName"], "IASP1");
    }
}
