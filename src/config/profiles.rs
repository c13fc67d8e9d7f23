use crate::error::{AppError, AppResult};
use crate::ssh::{AuthMethod, KnownHostsPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Target identity of a connection. Credentials are referenced by the
/// connection name and resolved through the secret store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
}

fn default_port() -> u16 {
    22
}

fn default_keepalive() -> u32 {
    60
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_method: AuthMethod::Password,
            keepalive_interval: default_keepalive(),
            known_hosts_policy: KnownHostsPolicy::default(),
        }
    }
}

/// Profile file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
}

/// Profile manager over `profiles.toml`
pub struct ProfileManager {
    profiles: BTreeMap<String, ConnectionProfile>,
    config_path: PathBuf,
}

impl ProfileManager {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("profiles.toml");
        let profiles = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ProfilesFile = toml::from_str(&content)?;
            file.profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            profiles,
            config_path,
        })
    }

    pub fn save(&self) -> AppResult<()> {
        let file = ProfilesFile {
            profiles: self.profiles.values().cloned().collect(),
        };
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<ConnectionProfile> {
        self.profiles.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> AppResult<ConnectionProfile> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::ProfileNotFound(name.to_string()))
    }

    pub fn add(&mut self, profile: ConnectionProfile) -> AppResult<()> {
        if profile.host.is_empty() || profile.username.is_empty() {
            return Err(AppError::InvalidConfig(format!(
                "Profile {} needs a host and a user",
                profile.name
            )));
        }
        self.profiles.insert(profile.name.clone(), profile);
        self.save()
    }

    pub fn update(&mut self, profile: ConnectionProfile) -> AppResult<()> {
        if !self.profiles.contains_key(&profile.name) {
            return Err(AppError::ProfileNotFound(profile.name));
        }
        self.profiles.insert(profile.name.clone(), profile);
        self.save()
    }

    pub fn delete(&mut self, name: &str) -> AppResult<()> {
        self.profiles
            .remove(name)
            .ok_or_else(|| AppError::ProfileNotFound(name.to_string()))?;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_manager_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProfileManager::load(dir.path()).unwrap();
        assert!(manager.list().is_empty());

        let mut profile = ConnectionProfile::new("dev", "pub400.com", "ALICE");
        profile.port = 2222;
        manager.add(profile.clone()).unwrap();

        let reloaded = ProfileManager::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("dev").unwrap(), profile);
    }

    #[test]
    fn test_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProfileManager::load(dir.path()).unwrap();
        assert!(matches!(manager.get("nope"), Err(AppError::ProfileNotFound(_))));
        assert!(manager.delete("nope").is_err());
        assert!(manager.add(ConnectionProfile::new("bad", "", "")).is_err());
    }
}
