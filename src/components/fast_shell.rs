use super::{test_stream_file, Component, ComponentContext, ComponentIdentification, ComponentState};
use crate::command::{CommandChannel, CommandData};
use crate::error::AppResult;
use parking_lot::RwLock;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

const TEST_TEXT: &str = "Hello world";

/// Pre-authenticated QSH replacement. It is a single executable uploaded
/// into the install directory; QSH command text is piped to it on stdin.
#[derive(Default)]
pub struct FastShell {
    local_asset: RwLock<Option<PathBuf>>,
    install_path: RwLock<String>,
}

impl FastShell {
    pub const ID: &'static str = "cqsh";
    pub const VERSION: u32 = 1;

    pub fn new(local_asset: Option<PathBuf>) -> Self {
        Self {
            local_asset: RwLock::new(local_asset),
            install_path: RwLock::new(String::new()),
        }
    }

    pub fn set_local_asset(&self, path: PathBuf) {
        *self.local_asset.write() = Some(path);
    }

    pub fn file_name() -> String {
        format!("{}_{}", Self::ID, Self::VERSION)
    }

    pub fn install_path(&self) -> String {
        self.install_path.read().clone()
    }

    fn test_command(&self, channel: &CommandChannel) -> AppResult<bool> {
        let result = channel.send_command(
            &CommandData::new(self.install_path()).with_stdin(format!("echo \"{}\"", TEST_TEXT)),
        )?;
        Ok(result.code == 0 && result.stdout == TEST_TEXT)
    }
}

impl Component for FastShell {
    fn identification(&self) -> ComponentIdentification {
        ComponentIdentification::new(Self::ID, Self::VERSION)
    }

    fn set_install_directory(&self, install_directory: &str) {
        *self.install_path.write() = join_path(install_directory, &Self::file_name());
    }

    fn remote_state(&self, context: &ComponentContext<'_>, install_directory: &str) -> AppResult<ComponentState> {
        self.set_install_directory(install_directory);

        if !test_stream_file(context.channel, &self.install_path(), 'x')? {
            return Ok(ComponentState::NotInstalled);
        }

        if !self.test_command(context.channel)? {
            return Ok(ComponentState::Error);
        }

        Ok(ComponentState::Installed)
    }

    fn update(&self, context: &ComponentContext<'_>, _install_directory: &str) -> AppResult<ComponentState> {
        let Some(asset) = self.local_asset.read().clone() else {
            tracing::info!("No local build of {} to upload", Self::ID);
            return Ok(ComponentState::Error);
        };

        let contents = match std::fs::read(&asset) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", asset, e);
                return Ok(ComponentState::Error);
            }
        };

        let install_path = self.install_path();
        if let Some((directory, _)) = install_path.rsplit_once('/') {
            context
                .channel
                .send_command(&CommandData::new(format!("mkdir -p {}", directory)))?;
        }
        context.channel.upload(&install_path, &contents)?;
        context
            .channel
            .send_command(&CommandData::new(format!("chmod +x {}", install_path)))?;

        if !self.test_command(context.channel)? {
            return Ok(ComponentState::Error);
        }

        Ok(ComponentState::Installed)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn join_path(directory: &str, file: &str) -> String {
    format!("{}/{}", directory.trim_end_matches('/'), file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellContext;
    use crate::sql::SqlEngine;
    use crate::ssh::testing::ScriptedTransport;
    use std::io::Write;

    fn context_parts(transport: Arc<ScriptedTransport>) -> (Arc<CommandChannel>, SqlEngine) {
        let channel = Arc::new(CommandChannel::new(transport, ShellContext::default(), None));
        let sql = SqlEngine::new(channel.clone());
        (channel, sql)
    }

    #[test]
    fn test_not_installed_when_missing() {
        let transport = ScriptedTransport::new();
        transport.on("test -x /home/bob/.ibmi/cqsh_1", 1, "", "");
        let (channel, sql) = context_parts(transport);
        let context = ComponentContext { channel: &channel, sql: &sql };

        let shell = FastShell::default();
        assert_eq!(shell.remote_state(&context, "/home/bob/.ibmi/").unwrap(), ComponentState::NotInstalled);
        assert_eq!(shell.install_path(), "/home/bob/.ibmi/cqsh_1");
    }

    #[test]
    fn test_installed_when_echo_works() {
        let transport = ScriptedTransport::new();
        transport.on("echo \"Hello world\"", 0, "Hello world\n", "");
        let (channel, sql) = context_parts(transport);
        let context = ComponentContext { channel: &channel, sql: &sql };

        let shell = FastShell::default();
        assert_eq!(shell.remote_state(&context, "/home/bob/.ibmi").unwrap(), ComponentState::Installed);
    }

    #[test]
    fn test_broken_helper_is_error() {
        let transport = ScriptedTransport::new();
        transport.on("echo \"Hello world\"", 0, "garbage", "");
        let (channel, sql) = context_parts(transport);
        let context = ComponentContext { channel: &channel, sql: &sql };
        assert_eq!(
            FastShell::default().remote_state(&context, "/home/bob/.ibmi").unwrap(),
            ComponentState::Error
        );
    }

    #[test]
    fn test_update_without_asset_is_error() {
        let (channel, sql) = context_parts(ScriptedTransport::new());
        let context = ComponentContext { channel: &channel, sql: &sql };
        assert_eq!(FastShell::default().update(&context, "/x").unwrap(), ComponentState::Error);
    }

    #[test]
    fn test_update_uploads_asset() {
        let mut asset = tempfile::NamedTempFile::new().unwrap();
        asset.write_all(b"binary").unwrap();

        let transport = ScriptedTransport::new();
        transport.on("echo \"Hello world\"", 0, "Hello world", "");
        let (channel, sql) = context_parts(transport.clone());
        let context = ComponentContext { channel: &channel, sql: &sql };

        let shell = FastShell::new(Some(asset.path().to_path_buf()));
        shell.set_install_directory("/home/bob/.ibmi/");
        assert_eq!(shell.update(&context, "/home/bob/.ibmi/").unwrap(), ComponentState::Installed);
        assert_eq!(transport.file("/home/bob/.ibmi/cqsh_1"), Some(b"binary".to_vec()));
        assert!(transport.ran("chmod +x /home/bob/.ibmi/cqsh_1"));
    }
}
