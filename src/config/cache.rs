//! Discovery caches
//!
//! Two JSON blobs keyed by connection name: the facts discovered during the
//! last handshake, and the install state of every remote component.

use crate::components::{ComponentIdentification, ComponentInstallState};
use crate::encoding::VariantChars;
use crate::error::AppResult;
use crate::session::{AspInfo, RemoteFeatureTable};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Facts from a previous handshake that quick connect may replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachedServerSettings {
    pub last_checked_on_version: Option<String>,
    pub i_asp_info: Vec<AspInfo>,
    pub qccsid: Option<i32>,
    pub job_ccsid: Option<i32>,
    pub user_default_ccsid: Option<i32>,
    pub sshd_ccsid: Option<i32>,
    pub remote_features: RemoteFeatureTable,
    pub remote_features_keys: Option<String>,
    pub variant_chars: Option<VariantChars>,
    pub bad_data_areas_checked: bool,
    pub library_list_validated: bool,
    pub path_checked: bool,
    pub debug_config_loaded: bool,
    pub debug_config: BTreeMap<String, String>,
    pub maximum_args_length: Option<u64>,
    pub os_version: Option<String>,
}

impl CachedServerSettings {
    /// Written by this build of the crate
    pub fn is_current(&self) -> bool {
        self.last_checked_on_version.as_deref() == Some(env!("CARGO_PKG_VERSION"))
    }
}

/// Discovery cache keyed by connection name
pub trait DiscoveryStore: Send + Sync {
    fn server_settings(&self, name: &str) -> AppResult<Option<CachedServerSettings>>;
    fn set_server_settings(&self, name: &str, settings: &CachedServerSettings) -> AppResult<()>;
    fn component_states(&self, name: &str) -> AppResult<Vec<ComponentInstallState>>;
    /// Insert or replace the record for `state.id.name`
    fn store_component_state(&self, name: &str, state: &ComponentInstallState) -> AppResult<()>;
}

/// File-backed store: `discovery.json` and `components.json`
pub struct JsonDiscoveryStore {
    discovery_path: PathBuf,
    components_path: PathBuf,
    lock: RwLock<()>,
}

impl JsonDiscoveryStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            discovery_path: config_dir.join("discovery.json"),
            components_path: config_dir.join("components.json"),
            lock: RwLock::new(()),
        }
    }

    fn read_map<T: DeserializeOwned>(path: &Path) -> AppResult<BTreeMap<String, T>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map<T: Serialize>(path: &Path, map: &BTreeMap<String, T>) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(map)?)?;
        Ok(())
    }
}

impl DiscoveryStore for JsonDiscoveryStore {
    fn server_settings(&self, name: &str) -> AppResult<Option<CachedServerSettings>> {
        let _guard = self.lock.read();
        let mut map: BTreeMap<String, CachedServerSettings> = Self::read_map(&self.discovery_path)?;
        Ok(map.remove(name))
    }

    fn set_server_settings(&self, name: &str, settings: &CachedServerSettings) -> AppResult<()> {
        let _guard = self.lock.write();
        let mut map: BTreeMap<String, CachedServerSettings> = Self::read_map(&self.discovery_path)?;
        map.insert(name.to_string(), settings.clone());
        Self::write_map(&self.discovery_path, &map)
    }

    fn component_states(&self, name: &str) -> AppResult<Vec<ComponentInstallState>> {
        let _guard = self.lock.read();
        let mut map: BTreeMap<String, Vec<ComponentInstallState>> = Self::read_map(&self.components_path)?;
        Ok(map.remove(name).unwrap_or_default())
    }

    fn store_component_state(&self, name: &str, state: &ComponentInstallState) -> AppResult<()> {
        let _guard = self.lock.write();
        let mut map: BTreeMap<String, Vec<ComponentInstallState>> = Self::read_map(&self.components_path)?;
        let states = map.entry(name.to_string()).or_default();
        upsert_state(states, state);
        Self::write_map(&self.components_path, &map)
    }
}

fn upsert_state(states: &mut Vec<ComponentInstallState>, state: &ComponentInstallState) {
    let same = |id: &ComponentIdentification| id.name == state.id.name;
    match states.iter_mut().find(|s| same(&s.id)) {
        Some(existing) => *existing = state.clone(),
        None => states.push(state.clone()),
    }
}
