use super::handshake::Handshake;
use super::{ConnectResult, ConnectionCallbacks, Session};
use crate::command::{CommandChannel, ShellContext};
use crate::components::{ComponentManager, FastShell, GetNewLibl, SqlToCsv};
use crate::config::{
    get_config_dir, ConnectionProfile, ConnectionSettings, DiscoveryStore, JsonDiscoveryStore, SettingsStore,
    TomlSettingsStore,
};
use crate::error::{AppError, AppResult};
use crate::keychain::{passphrase_key, password_key, private_key_key, KeyringSecretStore, SecretStore};
use crate::logging::OutputSink;
use crate::ssh::{AuthMethod, Credentials, HostKeyInfo, KeepaliveMonitor, SshTransport, Transport};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Where a connection keeps its settings, discovery cache and secrets
#[derive(Clone)]
pub struct SessionStores {
    pub settings: Arc<dyn SettingsStore>,
    pub discovery: Arc<dyn DiscoveryStore>,
    pub secrets: Arc<dyn SecretStore>,
}

impl SessionStores {
    /// File-backed stores under `config_dir`, secrets in the OS keychain
    pub fn open(config_dir: &Path) -> Self {
        Self {
            settings: Arc::new(TomlSettingsStore::new(config_dir)),
            discovery: Arc::new(JsonDiscoveryStore::new(config_dir)),
            secrets: Arc::new(KeyringSecretStore::new(config_dir)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Ignore the discovery cache and probe everything again
    pub reload_server_settings: bool,
    pub known_hosts_path: Option<PathBuf>,
}

/// One configured IBM i target and, once connected, its session
pub struct Connection {
    profile: ConnectionProfile,
    stores: SessionStores,
    sink: Option<Arc<dyn OutputSink>>,
    components: Arc<ComponentManager>,
    cancelled: Arc<AtomicBool>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    monitor: Mutex<Option<KeepaliveMonitor>>,
    session: RwLock<Option<Arc<Session>>>,
}

impl Connection {
    pub fn new(profile: ConnectionProfile, stores: SessionStores) -> Self {
        let components = ComponentManager::new();
        components.register(Arc::new(FastShell::new(None)));
        components.register(Arc::new(GetNewLibl::new("ILEDITOR")));
        components.register(Arc::new(SqlToCsv::new("ILEDITOR", "/tmp")));

        Self {
            profile,
            stores,
            sink: None,
            components: Arc::new(components),
            cancelled: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(None),
            monitor: Mutex::new(None),
            session: RwLock::new(None),
        }
    }

    /// Mirror every command and its output into `sink`
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn components(&self) -> &Arc<ComponentManager> {
        &self.components
    }

    fn credentials(&self) -> AppResult<Credentials> {
        let secrets = &self.stores.secrets;
        let name = &self.profile.name;
        let mut credentials = Credentials::default();

        match self.profile.auth_method {
            AuthMethod::Password => {
                credentials.password = secrets.get(&password_key(name))?;
            }
            AuthMethod::Key => {
                credentials.private_key = secrets.get(&private_key_key(name))?;
                credentials.passphrase = secrets.get(&passphrase_key(name))?;
            }
            AuthMethod::Agent => {}
        }
        Ok(credentials)
    }

    /// Open SSH and run the handshake
    pub fn connect(&self, callbacks: Arc<dyn ConnectionCallbacks>, options: &ConnectOptions) -> ConnectResult {
        callbacks.progress("Connecting via SSH.");

        let opened = self.credentials().and_then(|credentials| {
            let known_hosts = match options.known_hosts_path.clone() {
                Some(path) => path,
                None => get_config_dir()?.join("known_hosts"),
            };
            SshTransport::connect(&self.profile, credentials, &known_hosts, &|info: &HostKeyInfo| {
                callbacks.confirm_host_key(info)
            })
        });

        match opened {
            Ok(transport) => self.connect_with_transport(Arc::new(transport), callbacks, options),
            Err(e) => {
                error!("Connection to {} failed: {}", self.profile.name, e);
                ConnectResult {
                    success: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Run the handshake over an already authenticated transport
    pub fn connect_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        callbacks: Arc<dyn ConnectionCallbacks>,
        options: &ConnectOptions,
    ) -> ConnectResult {
        *self.transport.lock() = Some(transport.clone());
        callbacks.progress("Loading configuration.");

        let name = self.profile.name.clone();
        let settings = match self.stores.settings.load(&name) {
            Ok(settings) => settings.unwrap_or_else(|| ConnectionSettings::new(&name)),
            Err(e) => {
                warn!("Could not load settings for {}: {}", name, e);
                ConnectionSettings::new(&name)
            }
        };

        let cached = match self.stores.discovery.server_settings(&name) {
            Ok(cached) => cached.filter(|c| c.is_current() && !options.reload_server_settings),
            Err(e) => {
                warn!("Could not load the discovery cache for {}: {}", name, e);
                None
            }
        };
        let quick_connect = settings.quick_connect && !options.reload_server_settings;

        let context = ShellContext {
            username: self.profile.username.clone(),
            host: self.profile.host.clone(),
            home_directory: settings.home_directory.clone(),
            current_library: settings.current_library.clone(),
            library_list: settings.library_list.clone(),
            temp_library: settings.temp_library.clone(),
            temp_dir: settings.temp_dir.clone(),
            custom_variables: settings.custom_variables.clone(),
            ..Default::default()
        };
        let channel = Arc::new(CommandChannel::new(transport.clone(), context, self.sink.clone()));
        let session = Session::new(&name, channel, self.components.clone(), settings);

        let outcome = {
            let mut handshake = Handshake::new(
                &session,
                callbacks.as_ref(),
                self.stores.discovery.as_ref(),
                &self.cancelled,
                cached,
                quick_connect,
            );
            let result = handshake.run(&|| self.start_monitor(&transport, &callbacks));
            (result, handshake.error_codes())
        };

        if let Err(e) = self.stores.settings.save(&session.settings()) {
            warn!("Could not save settings for {}: {}", name, e);
        }

        let result = match outcome {
            (Ok(()), error_codes) => {
                info!("Connected to {}", name);
                *self.session.write() = Some(Arc::new(session));
                ConnectResult {
                    success: true,
                    error_codes,
                    error: None,
                }
            }
            (Err(e), error_codes) => {
                error!("Handshake with {} failed: {}", name, e);
                self.teardown();
                ConnectResult {
                    success: false,
                    error_codes,
                    error: Some(e.to_string()),
                }
            }
        };

        // A cancel only applies to the attempt it was issued for
        self.cancelled.store(false, Ordering::SeqCst);
        result
    }

    fn start_monitor(&self, transport: &Arc<dyn Transport>, callbacks: &Arc<dyn ConnectionCallbacks>) {
        let interval = Duration::from_secs(u64::from(self.profile.keepalive_interval.max(1)));
        let cancelled = self.cancelled.clone();
        let callbacks = callbacks.clone();

        let monitor = KeepaliveMonitor::start(transport.clone(), interval, move || {
            if !cancelled.load(Ordering::SeqCst) {
                callbacks.on_disconnected();
            }
        });
        *self.monitor.lock() = Some(monitor);
    }

    fn teardown(&self) {
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
    }

    /// Abort a running or upcoming connect; the handshake stops at its next step
    pub fn cancel(&self) {
        info!("Cancelling connection to {}", self.profile.name);
        self.cancelled.store(true, Ordering::SeqCst);
        self.teardown();
    }

    /// Disconnect and write the session's settings back
    pub fn end(&self) -> AppResult<()> {
        self.teardown();
        if let Some(session) = self.session.write().take() {
            self.stores.settings.save(&session.settings())?;
            info!("Disconnected from {}", self.profile.name);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
            && self
                .transport
                .lock()
                .as_ref()
                .map_or(false, |transport| transport.is_connected())
    }

    pub fn session(&self) -> AppResult<Arc<Session>> {
        self.session.read().clone().ok_or(AppError::NotConnected)
    }
}
