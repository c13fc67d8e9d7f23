use super::{with_directory, AuthMethod, ExecOutput, ExecRequest, KnownHostsPolicy, Transport};
use crate::config::ConnectionProfile;
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, Session as Ssh2Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Secrets resolved for one connect attempt
#[derive(Default, Clone)]
pub struct Credentials {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Host key information for verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyInfo {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint_sha256: String,
}

/// Host key decision from the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKeyDecision {
    #[serde(rename = "once")]
    TrustOnce,
    #[serde(rename = "always")]
    TrustAlways,
    #[serde(rename = "reject")]
    Reject,
}

/// ssh2-backed transport. Calls are serialized on the session lock.
pub struct SshTransport {
    id: String,
    session: Mutex<Ssh2Session>,
    sftp: Mutex<Option<Sftp>>,
    connected: AtomicBool,
}

impl SshTransport {
    /// Open TCP, handshake, verify the host key and authenticate
    pub fn connect(
        profile: &ConnectionProfile,
        credentials: Credentials,
        known_hosts_path: &Path,
        confirm_host_key: &dyn Fn(&HostKeyInfo) -> HostKeyDecision,
    ) -> AppResult<Self> {
        let id = uuid::Uuid::new_v4().to_string();

        // Log connection attempt (no secrets!)
        tracing::info!(
            "Connecting to {}@{}:{} (transport {})",
            profile.username,
            profile.host,
            profile.port,
            id
        );

        let addr = (profile.host.as_str(), profile.port)
            .to_socket_addrs()
            .map_err(|e| AppError::Connection(format!("Could not resolve {}: {}", profile.host, e)))?
            .next()
            .ok_or_else(|| AppError::Connection(format!("No address found for {}", profile.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(30))
            .map_err(|e| AppError::Connection(format!("TCP connect failed: {}", e)))?;
        tcp.set_nodelay(true)?;

        let mut ssh_session = Ssh2Session::new()
            .map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
        ssh_session.set_tcp_stream(tcp);
        ssh_session.set_timeout(0);
        ssh_session.set_keepalive(true, profile.keepalive_interval);

        ssh_session
            .handshake()
            .map_err(|e| AppError::Ssh(format!("SSH handshake failed: {}", e)))?;

        verify_host_key(&ssh_session, profile, known_hosts_path, confirm_host_key)?;
        authenticate(&mut ssh_session, profile, credentials)?;

        tracing::info!("SSH authentication successful (transport {})", id);

        Ok(Self {
            id,
            session: Mutex::new(ssh_session),
            sftp: Mutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::NotConnected)
        }
    }

    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> AppResult<T>) -> AppResult<T> {
        self.ensure_connected()?;
        let mut sftp = self.sftp.lock();
        if sftp.is_none() {
            let opened = self
                .session
                .lock()
                .sftp()
                .map_err(|e| AppError::Ssh(format!("Failed to open SFTP: {}", e)))?;
            *sftp = Some(opened);
        }
        match sftp.as_ref() {
            Some(handle) => f(handle),
            None => Err(AppError::Ssh("SFTP unavailable".to_string())),
        }
    }
}

impl Transport for SshTransport {
    fn exec(&self, request: &ExecRequest) -> AppResult<ExecOutput> {
        self.ensure_connected()?;
        let session = self.session.lock();

        let mut channel = session
            .channel_session()
            .map_err(|e| self.transport_failure(format!("Failed to open channel: {}", e)))?;
        channel
            .exec(&with_directory(&request.command, request.cwd.as_deref()))
            .map_err(|e| self.transport_failure(format!("Failed to exec: {}", e)))?;

        if let Some(stdin) = &request.stdin {
            channel
                .write_all(stdin.as_bytes())
                .map_err(|e| AppError::Ssh(format!("Failed to write stdin: {}", e)))?;
        }
        channel.send_eof()?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let code = channel.exit_status().ok();

        Ok(ExecOutput {
            code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn download(&self, remote_path: &str) -> AppResult<Vec<u8>> {
        self.with_sftp(|sftp| {
            let mut file = sftp
                .open(Path::new(remote_path))
                .map_err(|e| AppError::Ssh(format!("Failed to open {}: {}", remote_path, e)))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| AppError::Ssh(format!("Failed to read {}: {}", remote_path, e)))?;
            Ok(contents)
        })
    }

    fn upload(&self, remote_path: &str, contents: &[u8]) -> AppResult<()> {
        self.with_sftp(|sftp| {
            let mut file = sftp
                .create(Path::new(remote_path))
                .map_err(|e| AppError::Ssh(format!("Failed to create {}: {}", remote_path, e)))?;
            file.write_all(contents)
                .map_err(|e| AppError::Ssh(format!("Failed to write {}: {}", remote_path, e)))?;
            Ok(())
        })
    }

    fn keepalive(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.session
            .lock()
            .keepalive_send()
            .map(|_| ())
            .map_err(|e| self.transport_failure(format!("Keepalive failed: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.sftp.lock().take();
            let _ = self.session.lock().disconnect(None, "Session closed", None);
            tracing::info!("SSH transport closed ({})", self.id);
        }
    }
}

impl SshTransport {
    /// Channel-level failures mean the session is gone
    fn transport_failure(&self, message: String) -> AppError {
        tracing::warn!("Transport failure ({}): {}", self.id, sanitize_error_message(&message));
        self.connected.store(false, Ordering::SeqCst);
        AppError::Connection(message)
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// Verify the host key against known_hosts, applying the profile's policy
fn verify_host_key(
    ssh_session: &Ssh2Session,
    profile: &ConnectionProfile,
    known_hosts_path: &Path,
    confirm_host_key: &dyn Fn(&HostKeyInfo) -> HostKeyDecision,
) -> AppResult<()> {
    let (key, key_type) = ssh_session
        .host_key()
        .ok_or_else(|| AppError::Ssh("No host key received".to_string()))?;

    let mut known_hosts = ssh_session
        .known_hosts()
        .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
    if known_hosts_path.exists() {
        let _ = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH);
    }

    match known_hosts.check_port(&profile.host, profile.port, key) {
        CheckResult::Match => {
            tracing::debug!("Host key matched for {}:{}", profile.host, profile.port);
            Ok(())
        }
        CheckResult::NotFound => {
            let info = HostKeyInfo {
                host: profile.host.clone(),
                port: profile.port,
                key_type: key_type_name(key_type).to_string(),
                fingerprint_sha256: compute_sha256_fingerprint(key),
            };
            tracing::info!("Unknown host key for {}:{} ({})", info.host, info.port, info.fingerprint_sha256);

            let decision = match profile.known_hosts_policy {
                KnownHostsPolicy::Strict => HostKeyDecision::Reject,
                KnownHostsPolicy::Ask => confirm_host_key(&info),
                KnownHostsPolicy::Accept => HostKeyDecision::TrustAlways,
            };

            match decision {
                HostKeyDecision::TrustOnce => Ok(()),
                HostKeyDecision::TrustAlways => {
                    let key_format = match key_type {
                        HostKeyType::Rsa => ssh2::KnownHostKeyFormat::SshRsa,
                        HostKeyType::Dss => ssh2::KnownHostKeyFormat::SshDss,
                        _ => ssh2::KnownHostKeyFormat::Unknown,
                    };
                    known_hosts
                        .add(
                            &profile.host,
                            key,
                            &format!("Added by ibmi-session on {}", chrono::Utc::now()),
                            key_format,
                        )
                        .map_err(|e| AppError::Ssh(format!("Failed to add known host: {}", e)))?;
                    if let Some(parent) = known_hosts_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    known_hosts
                        .write_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| AppError::Ssh(format!("Failed to write known_hosts: {}", e)))?;
                    Ok(())
                }
                HostKeyDecision::Reject => Err(AppError::Ssh(format!(
                    "Host key for {}:{} is not trusted",
                    profile.host, profile.port
                ))),
            }
        }
        CheckResult::Mismatch => {
            tracing::error!(
                "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                profile.host,
                profile.port
            );
            Err(AppError::Ssh("Host key mismatch - possible security risk".to_string()))
        }
        CheckResult::Failure => Err(AppError::Ssh("Failed to check known hosts".to_string())),
    }
}

fn authenticate(
    ssh_session: &mut Ssh2Session,
    profile: &ConnectionProfile,
    credentials: Credentials,
) -> AppResult<()> {
    let username = profile.username.as_str();

    match profile.auth_method {
        AuthMethod::Password => {
            let password = credentials
                .password
                .ok_or_else(|| AppError::Auth("Password required".to_string()))?;
            ssh_session
                .userauth_password(username, &password)
                .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
        }
        AuthMethod::Key => {
            let key_data = credentials
                .private_key
                .ok_or_else(|| AppError::Auth("Private key required".to_string()))?;

            let key_file_path = std::env::temp_dir().join(format!("ibmi_session_key_{}", uuid::Uuid::new_v4()));
            std::fs::write(&key_file_path, &key_data)
                .map_err(|e| AppError::Auth(format!("Failed to write temp key file: {}", e)))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&key_file_path, std::fs::Permissions::from_mode(0o600));
            }

            let auth_result = ssh_session.userauth_pubkey_file(
                username,
                None,
                &key_file_path,
                credentials.passphrase.as_deref(),
            );

            // Always delete the temp key file
            let _ = std::fs::remove_file(&key_file_path);

            auth_result.map_err(|e| {
                let msg = e.to_string().to_lowercase();
                if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                    AppError::Auth("Invalid passphrase or key format".to_string())
                } else {
                    AppError::Auth("Private key not accepted by server".to_string())
                }
            })?;
        }
        AuthMethod::Agent => {
            let mut agent = ssh_session
                .agent()
                .map_err(|_| AppError::Auth("SSH agent not available".to_string()))?;
            agent
                .connect()
                .map_err(|_| AppError::Auth("Failed to connect to SSH agent".to_string()))?;
            agent
                .list_identities()
                .map_err(|_| AppError::Auth("Failed to list SSH agent identities".to_string()))?;

            let identities = agent.identities().unwrap_or_default();
            if !identities.iter().any(|identity| agent.userauth(username, identity).is_ok()) {
                return Err(AppError::Auth("SSH agent authentication failed".to_string()));
            }
        }
    }

    if !ssh_session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }

    Ok(())
}

/// Compute SHA256 fingerprint of a key
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// Truncate error messages before they reach logs
pub fn sanitize_error_message(msg: &str) -> String {
    if msg.len() > 200 {
        let mut cut = 200;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &msg[..cut])
    } else {
        msg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_sanitize_error() {
        assert_eq!(sanitize_error_message("Short error"), "Short error");

        let sanitized = sanitize_error_message(&"a".repeat(300));
        assert!(sanitized.len() < 210);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("[REDACTED]"));
    }
}
