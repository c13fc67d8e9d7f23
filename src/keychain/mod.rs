use crate::error::{AppError, AppResult};
use keyring::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const SERVICE_NAME: &str = "ibmi-session";

/// Credential storage keyed by connection name
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, secret: &str) -> AppResult<()>;
    fn delete(&self, key: &str) -> AppResult<()>;
}

pub fn password_key(connection: &str) -> String {
    format!("password:{}", connection)
}

pub fn private_key_key(connection: &str) -> String {
    format!("key:{}", connection)
}

pub fn passphrase_key(connection: &str) -> String {
    format!("passphrase:{}", connection)
}

/// OS keychain with an encrypted local file when no keyring is usable.
/// The fallback key is stored on disk next to the secrets, so it only
/// protects against casual reads.
pub struct KeyringSecretStore {
    fallback: FallbackStore,
}

impl KeyringSecretStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            fallback: FallbackStore::new(config_dir),
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        match Entry::new(SERVICE_NAME, key) {
            Ok(entry) => match entry.get_password() {
                Ok(password) => return Ok(Some(password)),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!("OS keychain get failed, trying fallback: {}", e),
            },
            Err(e) => tracing::debug!("OS keychain unavailable for get, trying fallback: {}", e),
        }

        Ok(self.fallback.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, secret: &str) -> AppResult<()> {
        match Entry::new(SERVICE_NAME, key) {
            Ok(entry) => match entry.set_password(secret) {
                Ok(()) => {
                    tracing::debug!("Stored secret in OS keychain: {}", key);
                    return Ok(());
                }
                Err(e) => tracing::warn!("OS keychain failed, using fallback: {}", e),
            },
            Err(e) => tracing::warn!("OS keychain unavailable, using fallback: {}", e),
        }

        let mut store = self.fallback.load()?;
        store.insert(key.to_string(), secret.to_string());
        self.fallback.save(&store)?;
        tracing::warn!("Stored secret in fallback storage: {}", key);
        Ok(())
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        if let Ok(entry) = Entry::new(SERVICE_NAME, key) {
            match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!("OS keychain delete failed: {}", e),
            }
        }

        let mut store = self.fallback.load()?;
        if store.remove(key).is_some() {
            self.fallback.save(&store)?;
        }
        Ok(())
    }
}

/// AES-256-GCM encrypted JSON map: 12-byte nonce followed by ciphertext
struct FallbackStore {
    secrets_path: PathBuf,
    key_path: PathBuf,
}

impl FallbackStore {
    fn new(config_dir: &Path) -> Self {
        Self {
            secrets_path: config_dir.join(".secrets.enc"),
            key_path: config_dir.join(".keyfile"),
        }
    }

    fn key(&self) -> AppResult<[u8; 32]> {
        use rand::RngCore;

        if self.key_path.exists() {
            let key_data = fs::read(&self.key_path)
                .map_err(|e| AppError::Keychain(format!("Failed to read key file: {}", e)))?;
            if key_data.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&key_data);
                return Ok(key);
            }
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.key_path, key)
            .map_err(|e| AppError::Keychain(format!("Failed to write key file: {}", e)))?;
        restrict_permissions(&self.key_path);

        Ok(key)
    }

    fn load(&self) -> AppResult<HashMap<String, String>> {
        use aes_gcm::{
            aead::{Aead, KeyInit},
            Aes256Gcm, Nonce,
        };

        if !self.secrets_path.exists() {
            return Ok(HashMap::new());
        }

        let encrypted = fs::read(&self.secrets_path)
            .map_err(|e| AppError::Keychain(format!("Failed to read secrets file: {}", e)))?;
        if encrypted.len() < 12 {
            return Ok(HashMap::new());
        }

        let key = self.key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AppError::Keychain(format!("Failed to create cipher: {}", e)))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&encrypted[..12]), &encrypted[12..])
            .map_err(|e| AppError::Keychain(format!("Failed to decrypt secrets: {}", e)))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Keychain(format!("Failed to parse secrets: {}", e)))
    }

    fn save(&self, store: &HashMap<String, String>) -> AppResult<()> {
        use aes_gcm::{
            aead::{Aead, KeyInit},
            Aes256Gcm, Nonce,
        };
        use rand::RngCore;

        let key = self.key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AppError::Keychain(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let json = serde_json::to_vec(store)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), json.as_slice())
            .map_err(|e| AppError::Keychain(format!("Failed to encrypt secrets: {}", e)))?;

        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);
        fs::write(&self.secrets_path, &output)
            .map_err(|e| AppError::Keychain(format!("Failed to write secrets file: {}", e)))?;
        restrict_permissions(&self.secrets_path);

        Ok(())
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// In-memory store for tests and one-shot CLI use
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: parking_lot::RwLock<HashMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.secrets.read().get(key).cloned())
    }

    fn set(&self, key: &str, secret: &str) -> AppResult<()> {
        self.secrets.write().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        self.secrets.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = FallbackStore::new(dir.path());
        assert!(fallback.load().unwrap().is_empty());

        let mut secrets = HashMap::new();
        secrets.insert(password_key("dev"), "hunter2".to_string());
        fallback.save(&secrets).unwrap();

        let raw = fs::read(dir.path().join(".secrets.enc")).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("hunter2"));
        assert_eq!(fallback.load().unwrap().get("password:dev").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn test_secret_keys() {
        assert_eq!(password_key("dev"), "password:dev");
        assert_eq!(private_key_key("dev"), "key:dev");
        assert_eq!(passphrase_key("dev"), "passphrase:dev");
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySecretStore::default();
        store.set("password:dev", "pw").unwrap();
        assert_eq!(store.get("password:dev").unwrap().as_deref(), Some("pw"));
        store.delete("password:dev").unwrap();
        assert!(store.get("password:dev").unwrap().is_none());
    }
}
