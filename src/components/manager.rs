use super::{Component, ComponentContext, ComponentIdentification, ComponentInstallState, ComponentState};
use crate::command::{CommandChannel, CommandData};
use crate::error::AppResult;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory under the user's home where path-based components live
pub const INSTALL_DIRECTORY_NAME: &str = ".ibmi-session";

struct ComponentRuntime {
    component: Arc<dyn Component>,
    state: ComponentState,
}

/// Registry of the components known to one session, in registration order
#[derive(Default)]
pub struct ComponentManager {
    runtimes: RwLock<Vec<ComponentRuntime>>,
    install_directory: RwLock<Option<String>>,
}

impl ComponentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component; a component with the same name is replaced
    pub fn register(&self, component: Arc<dyn Component>) {
        let name = component.identification().name;
        let mut runtimes = self.runtimes.write();
        let runtime = ComponentRuntime {
            component,
            state: ComponentState::NotChecked,
        };
        match runtimes.iter_mut().find(|r| r.component.identification().name == name) {
            Some(existing) => *existing = runtime,
            None => runtimes.push(runtime),
        }
    }

    pub fn component_ids(&self) -> Vec<ComponentIdentification> {
        self.runtimes
            .read()
            .iter()
            .map(|r| r.component.identification())
            .collect()
    }

    /// Remote directory for path-based components, resolved once per session
    pub fn install_directory(&self, channel: &CommandChannel) -> String {
        if let Some(directory) = self.install_directory.read().clone() {
            return directory;
        }

        let echoed = channel
            .send_command(&CommandData::new(format!("echo \"$HOME/{}/\"", INSTALL_DIRECTORY_NAME)))
            .map(|result| result.stdout.trim().to_string())
            .unwrap_or_else(|e| {
                warn!("Could not resolve the component directory: {}", e);
                String::new()
            });

        let directory = if echoed.is_empty() {
            format!(
                "/home/{}/{}/",
                channel.context().username.to_lowercase(),
                INSTALL_DIRECTORY_NAME
            )
        } else {
            echoed
        };

        *self.install_directory.write() = Some(directory.clone());
        directory
    }

    /// Bring every component to a known state. A cached state for the same
    /// name and version is trusted as is; anything else is probed and, when
    /// not installed, updated. `persist` receives every resulting state.
    pub fn startup(
        &self,
        context: &ComponentContext<'_>,
        last_installed: &[ComponentInstallState],
        persist: &dyn Fn(&ComponentInstallState),
    ) {
        *self.install_directory.write() = None;
        let install_directory = self.install_directory(context.channel);

        let components: Vec<Arc<dyn Component>> =
            self.runtimes.read().iter().map(|r| r.component.clone()).collect();

        for component in components {
            component.reset();
            let id = component.identification();

            let cached = last_installed
                .iter()
                .find(|installed| installed.id.name == id.name && installed.id.version == id.version);

            let state = match cached {
                Some(installed) => {
                    debug!("Using cached state of {}: {:?}", id, installed.state);
                    component.set_install_directory(&install_directory);
                    installed.state
                }
                None => check(component.as_ref(), context, &install_directory),
            };

            self.set_state(&id.name, state);
            persist(&ComponentInstallState { id, state });
        }
    }

    fn set_state(&self, name: &str, state: ComponentState) {
        if let Some(runtime) = self
            .runtimes
            .write()
            .iter_mut()
            .find(|r| r.component.identification().name == name)
        {
            runtime.state = state;
        }
    }

    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.runtimes
            .read()
            .iter()
            .find(|r| r.component.identification().name == name)
            .map(|r| r.state)
    }

    /// The component, but only while its last known state is Installed
    /// unless `ignore_state` is set
    pub fn get(&self, name: &str, ignore_state: bool) -> Option<Arc<dyn Component>> {
        self.runtimes
            .read()
            .iter()
            .find(|r| r.component.identification().name == name)
            .filter(|r| ignore_state || r.state == ComponentState::Installed)
            .map(|r| r.component.clone())
    }

    pub fn get_as<T: Component + 'static>(&self, name: &str, ignore_state: bool) -> Option<Arc<T>> {
        self.get(name, ignore_state)?.as_any().downcast::<T>().ok()
    }

    pub fn install_states(&self) -> Vec<ComponentInstallState> {
        self.runtimes
            .read()
            .iter()
            .map(|r| ComponentInstallState {
                id: r.component.identification(),
                state: r.state,
            })
            .collect()
    }
}

fn check(component: &dyn Component, context: &ComponentContext<'_>, install_directory: &str) -> ComponentState {
    let id = component.identification();
    let outcome = component
        .remote_state(context, install_directory)
        .and_then(|state| -> AppResult<ComponentState> {
            if state == ComponentState::Installed {
                Ok(state)
            } else {
                info!("{} is {:?}, updating", id, state);
                component.update(context, install_directory)
            }
        });

    match outcome {
        Ok(state) => state,
        Err(e) => {
            warn!("Error occurred while checking component {}: {}", id, e);
            ComponentState::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellContext;
    use crate::components::FastShell;
    use crate::error::AppError;
    use crate::sql::SqlEngine;
    use crate::ssh::testing::ScriptedTransport;
    use parking_lot::Mutex;
    use std::any::Any;

    struct Scripted {
        name: &'static str,
        probe: ComponentState,
        after_update: Option<ComponentState>,
        updates: Mutex<u32>,
        resets: Mutex<u32>,
    }

    impl Scripted {
        fn new(name: &'static str, probe: ComponentState, after_update: Option<ComponentState>) -> Arc<Self> {
            Arc::new(Self {
                name,
                probe,
                after_update,
                updates: Mutex::new(0),
                resets: Mutex::new(0),
            })
        }
    }

    impl Component for Scripted {
        fn identification(&self) -> ComponentIdentification {
            ComponentIdentification::new(self.name, 1)
        }

        fn remote_state(&self, _: &ComponentContext<'_>, _: &str) -> AppResult<ComponentState> {
            Ok(self.probe)
        }

        fn update(&self, _: &ComponentContext<'_>, _: &str) -> AppResult<ComponentState> {
            *self.updates.lock() += 1;
            self.after_update
                .ok_or_else(|| AppError::Component("update blew up".to_string()))
        }

        fn reset(&self) {
            *self.resets.lock() += 1;
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn parts(transport: Arc<ScriptedTransport>) -> (Arc<CommandChannel>, SqlEngine) {
        let channel = Arc::new(CommandChannel::new(
            transport,
            ShellContext {
                username: "BOB".to_string(),
                ..Default::default()
            },
            None,
        ));
        let sql = SqlEngine::new(channel.clone());
        (channel, sql)
    }

    #[test]
    fn test_startup_state_machine() {
        let transport = ScriptedTransport::new();
        transport.on("echo \"$HOME/.ibmi-session/\"", 0, "/home/bob/.ibmi-session/", "");
        let (channel, sql) = parts(transport);
        let context = ComponentContext { channel: &channel, sql: &sql };

        let ready = Scripted::new("ready", ComponentState::Installed, None);
        let stale = Scripted::new("stale", ComponentState::NeedsUpdate, Some(ComponentState::Installed));
        let broken = Scripted::new("broken", ComponentState::NotInstalled, None);

        let manager = ComponentManager::new();
        manager.register(ready.clone());
        manager.register(stale.clone());
        manager.register(broken.clone());

        let persisted = Mutex::new(vec![]);
        manager.startup(&context, &[], &|state: &ComponentInstallState| persisted.lock().push(state.clone()));

        assert_eq!(manager.state("ready"), Some(ComponentState::Installed));
        assert_eq!(manager.state("stale"), Some(ComponentState::Installed));
        assert_eq!(manager.state("broken"), Some(ComponentState::Error));
        assert_eq!(*ready.updates.lock(), 0);
        assert_eq!(*stale.updates.lock(), 1);
        assert_eq!(*broken.resets.lock(), 1);
        assert_eq!(persisted.lock().len(), 3);

        assert!(manager.get("ready", false).is_some());
        assert!(manager.get("broken", false).is_none());
        assert!(manager.get("broken", true).is_some());
        assert!(manager.get("missing", true).is_none());
    }

    #[test]
    fn test_cached_state_skips_probe() {
        let (channel, sql) = parts(ScriptedTransport::new());
        let context = ComponentContext { channel: &channel, sql: &sql };

        let component = Scripted::new("cached", ComponentState::NotInstalled, None);
        let manager = ComponentManager::new();
        manager.register(component.clone());

        let cached = vec![ComponentInstallState {
            id: ComponentIdentification::new("cached", 1),
            state: ComponentState::Installed,
        }];
        manager.startup(&context, &cached, &|_: &ComponentInstallState| {});
        assert_eq!(manager.state("cached"), Some(ComponentState::Installed));
        assert_eq!(*component.updates.lock(), 0);

        let other_version = vec![ComponentInstallState {
            id: ComponentIdentification::new("cached", 2),
            state: ComponentState::Installed,
        }];
        manager.startup(&context, &other_version, &|_: &ComponentInstallState| {});
        assert_eq!(manager.state("cached"), Some(ComponentState::Error));
    }

    #[test]
    fn test_install_directory_fallback() {
        let transport = ScriptedTransport::new();
        transport.on("echo \"$HOME", 0, "", "");
        let (channel, _) = parts(transport);
        let manager = ComponentManager::new();
        assert_eq!(manager.install_directory(&channel), "/home/bob/.ibmi-session/");
    }

    #[test]
    fn test_typed_lookup() {
        let transport = ScriptedTransport::new();
        transport.on("echo \"$HOME", 0, "/home/bob/.ibmi-session/", "");
        let (channel, sql) = parts(transport);
        let context = ComponentContext { channel: &channel, sql: &sql };

        let manager = ComponentManager::new();
        manager.register(Arc::new(FastShell::default()));
        let cached = vec![ComponentInstallState {
            id: ComponentIdentification::new(FastShell::ID, FastShell::VERSION),
            state: ComponentState::Installed,
        }];
        manager.startup(&context, &cached, &|_: &ComponentInstallState| {});

        let shell = manager.get_as::<FastShell>(FastShell::ID, false).unwrap();
        assert_eq!(shell.install_path(), "/home/bob/.ibmi-session/cqsh_1");
    }
}
