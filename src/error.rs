use serde::Serialize;
use thiserror::Error;

/// Session layer error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database CLI reported an error. `sqlstate` is extracted from its diagnostic block.
    #[error("{message}")]
    Sql {
        message: String,
        sqlstate: Option<String>,
    },

    /// Member path rejected by the parser. The message names the violated rule.
    #[error("{0}")]
    InvalidPath(String),

    #[error("Feature unavailable: {0}")]
    FeatureUnavailable(String),

    #[error("Component error: {0}")]
    Component(String),

    #[error("Shell configuration error: {0}")]
    ShellConfig(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

}

impl AppError {
    pub fn sql(message: impl Into<String>, sqlstate: Option<String>) -> Self {
        AppError::Sql {
            message: message.into(),
            sqlstate,
        }
    }

    /// SQLSTATE carried by a SQL error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            AppError::Sql { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }
}

/// Serializable error for UI collaborators
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::Ssh(msg) => ("SSH_ERROR", msg.clone(), None),
            AppError::Connection(msg) => ("CONNECTION_ERROR", msg.clone(), None),
            AppError::Auth(msg) => ("AUTH_ERROR", "Authentication failed".to_string(), Some(msg.clone())),
            AppError::Keychain(msg) => ("KEYCHAIN_ERROR", msg.clone(), None),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
            AppError::Sql { message, sqlstate } => ("SQL_ERROR", message.clone(), sqlstate.clone()),
            AppError::InvalidPath(msg) => ("INVALID_PATH", msg.clone(), None),
            AppError::FeatureUnavailable(msg) => ("FEATURE_UNAVAILABLE", msg.clone(), None),
            AppError::Component(msg) => ("COMPONENT_ERROR", msg.clone(), None),
            AppError::ShellConfig(msg) => ("SHELL_CONFIG", msg.clone(), None),
            AppError::NotConnected => ("NOT_CONNECTED", "Not connected".to_string(), None),
            AppError::Cancelled => ("CANCELLED", "Operation cancelled".to_string(), None),
            AppError::ProfileNotFound(name) => ("PROFILE_NOT_FOUND", format!("Profile {} not found", name), None),
            AppError::InvalidConfig(msg) => ("INVALID_CONFIG", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Serialization(format!("CSV error: {}", err))
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Keychain(err.to_string())
    }
}

impl From<ssh2::Error> for AppError {
    fn from(err: ssh2::Error) -> Self {
        AppError::Ssh(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_error_carries_state() {
        let err = AppError::sql("Token X was not valid (42601)", Some("42601".to_string()));
        assert_eq!(err.sqlstate(), Some("42601"));
        assert_eq!(err.to_string(), "Token X was not valid (42601)");
    }

    #[test]
    fn test_invalid_path_message_is_verbatim() {
        let err = AppError::InvalidPath("Invalid Library name: ABCDEFGHIJK".to_string());
        assert_eq!(err.to_string(), "Invalid Library name: ABCDEFGHIJK");
        let serialized = serde_json::to_value(&err).unwrap();
        assert_eq!(serialized["code"], "INVALID_PATH");
    }
}
