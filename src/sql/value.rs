use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One column value of a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbValue {
    Null,
    Number(f64),
    Text(String),
}

impl DbValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbValue::Number(n) => Some(*n),
            DbValue::Text(text) => text.trim().parse().ok(),
            DbValue::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DbValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            DbValue::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbValue::Null => Ok(()),
            DbValue::Number(n) => write!(f, "{}", n),
            DbValue::Text(text) => f.write_str(text),
        }
    }
}

pub type DbRow = BTreeMap<String, DbValue>;

/// Positional value substituted for a `?` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl BindingValue {
    /// SQL literal for the value. Text becomes a `UX'...'` literal so it
    /// survives any job CCSID unchanged.
    pub fn to_sql_literal(&self) -> String {
        match self {
            BindingValue::Integer(n) => n.to_string(),
            BindingValue::Decimal(n) => n.to_string(),
            BindingValue::Text(text) => to_ux(text),
        }
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Text(value.to_string())
    }
}

impl From<String> for BindingValue {
    fn from(value: String) -> Self {
        BindingValue::Text(value)
    }
}

impl From<i64> for BindingValue {
    fn from(value: i64) -> Self {
        BindingValue::Integer(value)
    }
}

/// UTF-16 hex literal: four upper-case hex digits per code unit
pub fn to_ux(text: &str) -> String {
    let bytes: Vec<u8> = text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect();
    format!("UX'{}'", hex::encode_upper(bytes))
}

static CANONICAL_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?(0|[1-9]\d*)(\.\d+)?$").unwrap());
static LOOSE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap());

/// Numbers without leading zeros, so codes like `0042` stay text
pub fn sniff_canonical_number(text: &str) -> Option<f64> {
    if CANONICAL_NUMBER.is_match(text) {
        text.parse().ok()
    } else {
        None
    }
}

/// Any decimal numeral, used for the right-aligned columns of the CLI output
pub fn sniff_number(text: &str) -> Option<f64> {
    if LOOSE_NUMBER.is_match(text) {
        text.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_ux() {
        assert_eq!(to_ux("Hi"), "UX'00480069'");
        assert_eq!(to_ux("é"), "UX'00E9'");
        assert_eq!(to_ux(""), "UX''");
    }

    #[test]
    fn test_binding_literals() {
        assert_eq!(BindingValue::from(42).to_sql_literal(), "42");
        assert_eq!(BindingValue::Decimal(1.5).to_sql_literal(), "1.5");
        assert_eq!(BindingValue::from("QSYS2").to_sql_literal(), "UX'00510053005900530032'");
    }

    #[test]
    fn test_number_sniffing() {
        assert_eq!(sniff_canonical_number("12.5"), Some(12.5));
        assert_eq!(sniff_canonical_number("-3"), Some(-3.0));
        assert_eq!(sniff_canonical_number("0042"), None);
        assert_eq!(sniff_canonical_number("1e3"), None);
        assert_eq!(sniff_number("0042"), Some(42.0));
        assert_eq!(sniff_number("abc"), None);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(DbValue::Number(37.0).as_i64(), Some(37));
        assert_eq!(DbValue::Text("65535".to_string()).as_i64(), Some(65535));
        assert!(DbValue::Null.is_null());
        assert_eq!(DbValue::Text("QGPL".to_string()).to_string(), "QGPL");
    }
}
