use crate::ssh::{HostKeyDecision, HostKeyInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conditions reported during the handshake. Everything except
/// `ShellConfig` is a warning; the session continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionErrorCode {
    #[serde(rename = "shell_config")]
    ShellConfig,
    #[serde(rename = "home_directory_creation")]
    HomeDirectoryCreation,
    #[serde(rename = "invalid_home_directory")]
    InvalidHomeDirectory,
    #[serde(rename = "invalid_temp_lib")]
    InvalidTempLib,
    #[serde(rename = "QCPTOIMPF_exists")]
    QcptoimpfExists,
    #[serde(rename = "QCPFRMIMPF_exists")]
    QcpfrmimpfExists,
    #[serde(rename = "default_not_bash")]
    DefaultNotBash,
    #[serde(rename = "invalid_bashrc")]
    InvalidBashrc,
    #[serde(rename = "no_auto_conv_ebcdic")]
    NoAutoConvEbcdic,
    #[serde(rename = "invalid_libraries")]
    InvalidLibraries,
    #[serde(rename = "ccsid_warning")]
    CcsidWarning,
    #[serde(rename = "invalid_locale")]
    InvalidLocale,
    #[serde(rename = "no_sql_runner")]
    NoSqlRunner,
    #[serde(rename = "not_loaded_debug_config")]
    NotLoadedDebugConfig,
}

impl ConnectionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShellConfig => "shell_config",
            Self::HomeDirectoryCreation => "home_directory_creation",
            Self::InvalidHomeDirectory => "invalid_home_directory",
            Self::InvalidTempLib => "invalid_temp_lib",
            Self::QcptoimpfExists => "QCPTOIMPF_exists",
            Self::QcpfrmimpfExists => "QCPFRMIMPF_exists",
            Self::DefaultNotBash => "default_not_bash",
            Self::InvalidBashrc => "invalid_bashrc",
            Self::NoAutoConvEbcdic => "no_auto_conv_ebcdic",
            Self::InvalidLibraries => "invalid_libraries",
            Self::CcsidWarning => "ccsid_warning",
            Self::InvalidLocale => "invalid_locale",
            Self::NoSqlRunner => "no_sql_runner",
            Self::NotLoadedDebugConfig => "not_loaded_debug_config",
        }
    }
}

impl fmt::Display for ConnectionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// UI collaborator of the orchestrator. Every method has a silent default.
pub trait ConnectionCallbacks: Send + Sync {
    fn progress(&self, _message: &str) {}

    fn message(&self, _level: MessageLevel, _text: &str) {}

    /// Report a named condition with its details. Returning `true` accepts
    /// the remediation the code offers (create the home directory, delete the
    /// data area, fix `.bashrc`, drop missing libraries, switch to bash).
    fn on_connection_error(&self, _code: ConnectionErrorCode, _payload: &serde_json::Value) -> bool {
        false
    }

    fn confirm_host_key(&self, _info: &HostKeyInfo) -> HostKeyDecision {
        HostKeyDecision::Reject
    }

    /// The transport dropped after the handshake passed the shell check
    fn on_disconnected(&self) {}
}

/// Callbacks that decline every offer
pub struct SilentCallbacks;

impl ConnectionCallbacks for SilentCallbacks {}

/// Outcome of a connect attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<ConnectionErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_as_names() {
        for code in [
            ConnectionErrorCode::QcptoimpfExists,
            ConnectionErrorCode::NoAutoConvEbcdic,
            ConnectionErrorCode::NotLoadedDebugConfig,
        ] {
            assert_eq!(serde_json::to_string(&code).unwrap(), format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_result_json() {
        let result = ConnectResult {
            success: false,
            error_codes: vec![ConnectionErrorCode::ShellConfig],
            error: Some("Shell config error, connection aborted.".to_string()),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["errorCodes"][0], "shell_config");
        assert!(serde_json::to_value(&ConnectResult::default()).unwrap().get("error").is_none());
    }
}
