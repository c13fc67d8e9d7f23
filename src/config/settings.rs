use crate::error::AppResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A user-defined `&NAME` substitution for ILE commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomVariable {
    pub name: String,
    pub value: String,
}

/// Per-connection settings. Adjusted during the handshake and written back
/// when the connect attempt finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub name: String,
    #[serde(default = "default_home_directory")]
    pub home_directory: String,
    #[serde(default)]
    pub current_library: String,
    #[serde(default)]
    pub library_list: Vec<String>,
    #[serde(default = "default_temp_library")]
    pub temp_library: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_true")]
    pub auto_clear_temp_data: bool,
    #[serde(default = "default_true")]
    pub quick_connect: bool,
    #[serde(default = "default_true")]
    pub enable_sql: bool,
    #[serde(default)]
    pub auto_convert_ifs_ccsid: bool,
    #[serde(default = "default_true")]
    pub show_ccsid_warnings: bool,
    #[serde(default)]
    pub custom_variables: Vec<CustomVariable>,
    /// Local build of the fast shell helper to upload when it is missing
    #[serde(default)]
    pub fast_shell_asset: Option<PathBuf>,
}

fn default_home_directory() -> String {
    ".".to_string()
}

fn default_temp_library() -> String {
    "ILEDITOR".to_string()
}

fn default_temp_dir() -> String {
    "/tmp".to_string()
}

fn default_true() -> bool {
    true
}

impl ConnectionSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            home_directory: default_home_directory(),
            current_library: String::new(),
            library_list: vec![],
            temp_library: default_temp_library(),
            temp_dir: default_temp_dir(),
            auto_clear_temp_data: true,
            quick_connect: true,
            enable_sql: true,
            auto_convert_ifs_ccsid: false,
            show_ccsid_warnings: true,
            custom_variables: vec![],
            fast_shell_asset: None,
        }
    }
}

/// Persistent settings keyed by connection name
pub trait SettingsStore: Send + Sync {
    fn load(&self, name: &str) -> AppResult<Option<ConnectionSettings>>;
    fn save(&self, settings: &ConnectionSettings) -> AppResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    connections: BTreeMap<String, ConnectionSettings>,
}

/// Settings store backed by `connections.toml`
pub struct TomlSettingsStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl TomlSettingsStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join("connections.toml"),
            lock: RwLock::new(()),
        }
    }

    fn read_file(&self) -> AppResult<SettingsFile> {
        if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(SettingsFile::default())
        }
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self, name: &str) -> AppResult<Option<ConnectionSettings>> {
        let _guard = self.lock.read();
        Ok(self.read_file()?.connections.remove(name))
    }

    fn save(&self, settings: &ConnectionSettings) -> AppResult<()> {
        let _guard = self.lock.write();
        let mut file = self.read_file()?;
        file.connections.insert(settings.name.clone(), settings.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
