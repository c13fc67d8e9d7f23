//! Command channel
//!
//! Single dispatch point for the three execution environments of the host:
//!
//! - `pase`: one shell invocation, variables injected as exports
//! - `qsh`: the command piped into the QSH interpreter (or the fast shell helper)
//! - `ile`: QSH with the library list reset and reapplied, each CL command
//!   chained through `system` so the first failure stops the rest
//!
//! A non-zero exit code is a normal result. Only a transport failure is an
//! error.

pub mod messages;
pub mod variables;

pub use messages::*;
pub use variables::*;

use crate::config::CustomVariable;
use crate::encoding::VariantCharacterSet;
use crate::error::{AppError, AppResult};
use crate::logging::OutputSink;
use crate::ssh::{ExecRequest, Transport};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exit code reported when nothing was sent to the host
pub const DID_NOT_RUN: i32 = -123;
pub const BASH_PATH: &str = "/QOpenSys/pkgs/bin/bash";
pub const QSH_PATH: &str = "/QOpenSys/usr/bin/qsh";
/// Prefix of every temporary IFS file this session creates
pub const TEMP_FILE_PREFIX: &str = "ibmitemp-";

const CLEAR_OUTPUT_EVERY: usize = 150;
const LAST_ERRORS_KEPT: usize = 3;

/// Execution environment of a command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandEnvironment {
    #[default]
    Ile,
    Qsh,
    Pase,
}

/// Result of one remote call. `code` is always set; stdout and stderr are trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Low level shell call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandData {
    pub command: String,
    /// Defaults to the home directory
    pub directory: Option<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

impl CommandData {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// A command in one of the three environments, with variable expansion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    pub environment: CommandEnvironment,
    pub cwd: Option<String>,
    /// `&NAME` overrides, including `&CURLIB` and `&LIBL`
    pub env: BTreeMap<String, String>,
    /// Skip the library list setup for qsh and ile
    pub no_lib_list: bool,
}

impl RemoteCommand {
    pub fn new(environment: CommandEnvironment, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            environment,
            ..Default::default()
        }
    }
}

/// Session facts the channel needs to build command text
#[derive(Debug, Clone, Default)]
pub struct ShellContext {
    pub username: String,
    pub host: String,
    /// Login shell, once probed
    pub shell: Option<String>,
    pub home_directory: String,
    pub current_library: String,
    pub library_list: Vec<String>,
    pub default_user_libraries: Vec<String>,
    pub temp_library: String,
    pub temp_dir: String,
    pub custom_variables: Vec<CustomVariable>,
    /// Path of the fast shell helper when it is installed
    pub fast_shell: Option<String>,
    pub requires_translation: bool,
    pub variants: VariantCharacterSet,
}

impl ShellContext {
    pub fn is_bash(&self) -> bool {
        self.shell.as_deref() == Some(BASH_PATH)
    }
}

/// A failing command kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandError {
    pub command: String,
    pub code: i32,
    pub stderr: String,
}

pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    context: RwLock<ShellContext>,
    sink: Option<Arc<dyn OutputSink>>,
    commands_executed: AtomicUsize,
    last_errors: Mutex<VecDeque<CommandError>>,
    temp_remote_files: Mutex<HashMap<String, String>>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn Transport>, context: ShellContext, sink: Option<Arc<dyn OutputSink>>) -> Self {
        Self {
            transport,
            context: RwLock::new(context),
            sink,
            commands_executed: AtomicUsize::new(0),
            last_errors: Mutex::new(VecDeque::with_capacity(LAST_ERRORS_KEPT)),
            temp_remote_files: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn context(&self) -> ShellContext {
        self.context.read().clone()
    }

    pub fn update_context(&self, update: impl FnOnce(&mut ShellContext)) {
        update(&mut self.context.write());
    }

    pub fn last_errors(&self) -> Vec<CommandError> {
        self.last_errors.lock().iter().cloned().collect()
    }

    /// Run `data.command` through the login shell
    pub fn send_command(&self, data: &CommandData) -> AppResult<CommandResult> {
        let (is_bash, home) = {
            let context = self.context.read();
            (context.is_bash(), context.home_directory.clone())
        };

        let mut parts: Vec<String> = data
            .env
            .iter()
            .map(|(key, value)| export_statement(is_bash, key, value))
            .collect();
        parts.push(data.command.clone());
        let command = parts.join(" && ");
        let directory = data.directory.clone().unwrap_or(home);

        self.determine_clear();
        self.mirror(&format!("{}: {}\n", directory, command));
        if let Some(stdin) = data.stdin.as_deref() {
            self.mirror(&format!("{}\n", stdin));
        }

        debug!("Running command in {}", directory);
        let output = self.transport.exec(&ExecRequest {
            command: command.clone(),
            cwd: Some(directory),
            stdin: data.stdin.clone(),
        })?;

        let result = CommandResult {
            code: output.code.unwrap_or(0),
            stdout: output.stdout.trim().to_string(),
            stderr: output.stderr.trim().to_string(),
            command: None,
        };

        if result.code != 0 && !result.stderr.is_empty() {
            let mut errors = self.last_errors.lock();
            if errors.len() >= LAST_ERRORS_KEPT {
                errors.pop_front();
            }
            errors.push_back(CommandError {
                command,
                code: result.code,
                stderr: result.stderr.clone(),
            });
        }

        if let Ok(json) = serde_json::to_string_pretty(&result) {
            self.mirror(&format!("{}\n", json));
        }

        Ok(result)
    }

    /// Pipe `data.command` into QSH, or into the fast shell helper when installed
    pub fn send_qsh(&self, data: &CommandData) -> AppResult<CommandResult> {
        let context = self.context();
        let mut data = data.clone();

        let mut stdin = std::mem::take(&mut data.command);
        if context.requires_translation {
            stdin = context.variants.to_american(&stdin);
            data.directory = data.directory.map(|d| context.variants.to_american(&d));
        }

        data.stdin = Some(stdin);
        data.command = context.fast_shell.unwrap_or_else(|| QSH_PATH.to_string());
        self.send_command(&data)
    }

    /// Expand variables and run each line of `options.command` in its environment
    pub fn run_command(&self, options: &RemoteCommand) -> AppResult<CommandResult> {
        let context = self.context();
        let mut variables = Variables::new(
            &VariableSource {
                current_library: &context.current_library,
                username: &context.username,
                host: &context.host,
                home_directory: &context.home_directory,
                custom_variables: &context.custom_variables,
            },
            &options.env,
        );

        let current_library = variables
            .get("&CURLIB")
            .unwrap_or(&context.current_library)
            .to_string();

        let library_list = match variables.get("&LIBL") {
            Some(list) => distinct(list.split(' ').filter(|l| !l.is_empty()).map(str::to_string)),
            None => context.library_list.clone(),
        };
        let reversed = build_library_list(&library_list);
        variables.set("&LIBLS", &reversed.join(" "));

        let command_string = variables.expand(&options.command);
        let commands: Vec<&str> = command_string
            .split('\n')
            .filter(|c| !c.trim().is_empty())
            .collect();

        if commands.is_empty() {
            return Ok(CommandResult {
                code: DID_NOT_RUN,
                stdout: String::new(),
                stderr: "Command execution failed. (No command)".to_string(),
                command: Some(options.command.clone()),
            });
        }

        let lib_list_commands = || {
            if options.no_lib_list {
                vec![]
            } else {
                library_list_commands(&context.default_user_libraries, &current_library, &reversed)
            }
        };

        let mut result = match options.environment {
            CommandEnvironment::Pase => self.send_command(&CommandData {
                command: commands.join(" && "),
                directory: options.cwd.clone(),
                env: variables.to_pase_variables(),
                stdin: None,
            })?,
            CommandEnvironment::Qsh => {
                let mut all = lib_list_commands();
                all.extend(commands.iter().map(|c| c.to_string()));
                self.send_qsh(&CommandData {
                    command: all.join(" && "),
                    directory: options.cwd.clone(),
                    ..Default::default()
                })?
            }
            CommandEnvironment::Ile => {
                let mut all = lib_list_commands();
                all.extend(commands.iter().map(|c| format!("system \"{}\"", escape_system_command(c))));
                self.send_qsh(&CommandData {
                    command: all.join(" && "),
                    directory: options.cwd.clone(),
                    ..Default::default()
                })?
            }
        };

        result.command = Some(command_string);
        Ok(result)
    }

    pub fn download(&self, remote_path: &str) -> AppResult<Vec<u8>> {
        debug!("Downloading {}", remote_path);
        self.transport.download(remote_path)
    }

    pub fn upload(&self, remote_path: &str, contents: &[u8]) -> AppResult<()> {
        debug!("Uploading {} ({} bytes)", remote_path, contents.len());
        self.transport.upload(remote_path, contents)
    }

    pub fn read_text(&self, remote_path: &str) -> AppResult<String> {
        let bytes = self.download(remote_path)?;
        String::from_utf8(bytes).map_err(|e| AppError::Serialization(format!("{}: {}", remote_path, e)))
    }

    pub fn write_text(&self, remote_path: &str, contents: &str) -> AppResult<()> {
        self.upload(remote_path, contents.as_bytes())
    }

    /// Stable temporary IFS file for `key` within this session
    pub fn get_temp_remote(&self, key: &str) -> String {
        let mut files = self.temp_remote_files.lock();
        if let Some(existing) = files.get(key) {
            debug!("Using existing temp: {}", existing);
            return existing.clone();
        }

        let temp_dir = self.context.read().temp_dir.clone();
        let value = format!("{}/{}{}", temp_dir.trim_end_matches('/'), TEMP_FILE_PREFIX, make_id(8));
        debug!("Using new temp: {}", value);
        files.insert(key.to_string(), value.clone());
        value
    }

    /// Run `process` inside a fresh temporary directory that is removed afterwards
    pub fn with_temp_directory<T>(&self, process: impl FnOnce(&str) -> AppResult<T>) -> AppResult<T> {
        let temp_dir = {
            let context = self.context.read();
            if context.temp_dir.is_empty() {
                "/tmp".to_string()
            } else {
                context.temp_dir.trim_end_matches('/').to_string()
            }
        };
        let directory = format!("{}/{}{}", temp_dir, TEMP_FILE_PREFIX, make_id(20));

        let prepared = self.send_command(&CommandData::new(format!(
            "rm -rf {dir} && mkdir -p {dir}",
            dir = directory
        )))?;
        if prepared.code != 0 {
            return Err(AppError::Connection(format!(
                "Failed to create temporary directory {}: {}",
                directory, prepared.stderr
            )));
        }

        let outcome = process(&directory);
        if let Err(e) = self.send_command(&CommandData::new(format!("rm -rf {}", directory))) {
            warn!("Could not remove {}: {}", directory, e);
        }
        outcome
    }

    fn determine_clear(&self) {
        let executed = self.commands_executed.fetch_add(1, Ordering::SeqCst) + 1;
        if executed > CLEAR_OUTPUT_EVERY {
            if let Some(sink) = &self.sink {
                sink.clear();
            }
            self.commands_executed.store(0, Ordering::SeqCst);
        }
    }

    fn mirror(&self, content: &str) {
        if let Some(sink) = &self.sink {
            sink.append(content);
        }
    }
}

/// Random object-name-safe id, prefixed `O_`
pub fn make_id(length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("O_{}", suffix)
}

/// Escape `$` and `"` for a double-quoted shell string
pub fn escape_for_shell(text: &str) -> String {
    text.replace('$', "\\$").replace('"', "\\\"")
}

fn escape_system_command(text: &str) -> String {
    escape_for_shell(&text.replace('\\', "\\\\"))
}

fn export_statement(is_bash: bool, key: &str, value: &str) -> String {
    let value = escape_for_shell(value);
    if is_bash {
        format!("export {}=\"{}\"", key, value)
    } else {
        format!("{}=\"{}\" export {}", key, value, key)
    }
}

/// Quote names starting with `#` so PASE does not read them as comments
pub fn sanitize_obj_names_for_pase(libraries: &[String]) -> Vec<String> {
    libraries
        .iter()
        .map(|library| {
            if library.starts_with('#') {
                format!("\"{}\"", library)
            } else {
                library.clone()
            }
        })
        .collect()
}

/// `liblist -a` prepends, so the list is applied back to front
pub fn build_library_list(library_list: &[String]) -> Vec<String> {
    library_list.iter().rev().cloned().collect()
}

fn library_list_commands(defaults: &[String], current_library: &str, reversed: &[String]) -> Vec<String> {
    let escape = |names: Vec<String>| names.join(" ").replace('$', "\\$");

    let mut commands = vec![format!("liblist -d {}", escape(sanitize_obj_names_for_pase(defaults)))];
    if !current_library.is_empty() {
        commands.push(format!(
            "liblist -c {}",
            escape(sanitize_obj_names_for_pase(&[current_library.to_string()]))
        ));
    }
    if !reversed.is_empty() {
        commands.push(format!("liblist -a {}", escape(sanitize_obj_names_for_pase(reversed))));
    }
    commands
}

fn distinct(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::CommandLog;
    use crate::ssh::testing::ScriptedTransport;

    fn context() -> ShellContext {
        ShellContext {
            username: "BOB".to_string(),
            host: "dev400".to_string(),
            home_directory: "/home/bob".to_string(),
            current_library: "DEVLIB".to_string(),
            library_list: vec!["QGPL".to_string(), "#TOOLS".to_string()],
            default_user_libraries: vec!["QGPL".to_string(), "QTEMP".to_string()],
            temp_dir: "/tmp".to_string(),
            ..Default::default()
        }
    }

    fn channel(transport: Arc<ScriptedTransport>) -> CommandChannel {
        CommandChannel::new(transport, context(), None)
    }

    #[test]
    fn test_null_exit_code_is_zero() {
        let transport = ScriptedTransport::new();
        transport.on_no_code("echo hi", "hi\n");
        let result = channel(transport).send_command(&CommandData::new("echo hi")).unwrap();
        assert_eq!(result.code, 0);
        assert_eq!(result.stdout, "hi");
    }

    #[test]
    fn test_env_export_syntax_follows_shell() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        let mut data = CommandData::new("env");
        data.env.insert("A".to_string(), "1".to_string());

        channel.send_command(&data).unwrap();
        assert!(transport.ran("A=\"1\" export A && env"));

        channel.update_context(|c| c.shell = Some(BASH_PATH.to_string()));
        channel.send_command(&data).unwrap();
        assert!(transport.ran("export A=\"1\" && env"));
    }

    #[test]
    fn test_directory_defaults_to_home() {
        let transport = ScriptedTransport::new();
        channel(transport.clone()).send_command(&CommandData::new("pwd")).unwrap();
        assert_eq!(transport.calls()[0].cwd.as_deref(), Some("/home/bob"));
    }

    #[test]
    fn test_transport_failure_is_an_error() {
        let transport = ScriptedTransport::new();
        transport.on_failure("boom");
        assert!(channel(transport).send_command(&CommandData::new("boom")).is_err());
    }

    #[test]
    fn test_last_errors_keeps_three() {
        let transport = ScriptedTransport::new();
        transport.on("false", 1, "", "failed");
        let channel = channel(transport);
        for _ in 0..5 {
            channel.send_command(&CommandData::new("false")).unwrap();
        }
        channel.send_command(&CommandData::new("true")).unwrap();
        assert_eq!(channel.last_errors().len(), 3);
    }

    #[test]
    fn test_output_is_mirrored() {
        let transport = ScriptedTransport::new();
        let log = CommandLog::in_memory();
        let channel = CommandChannel::new(transport, context(), Some(log.clone()));
        channel
            .send_command(&CommandData::new("cat").with_stdin("payload"))
            .unwrap();

        let lines = log.recent(10, None);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].text.starts_with("/home/bob: cat"));
        assert!(lines[1].text.contains("payload"));
        assert!(lines[2].text.contains("\"code\": 0"));
    }

    #[test]
    fn test_send_qsh_pipes_command() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        channel.send_qsh(&CommandData::new("liblist")).unwrap();
        let call = &transport.calls()[0];
        assert_eq!(call.command, QSH_PATH);
        assert_eq!(call.stdin.as_deref(), Some("liblist"));

        channel.update_context(|c| c.fast_shell = Some("/home/bob/.ibmi/cqsh_1".to_string()));
        channel.send_qsh(&CommandData::new("liblist")).unwrap();
        assert_eq!(transport.calls()[1].command, "/home/bob/.ibmi/cqsh_1");
    }

    #[test]
    fn test_send_qsh_translates_variants() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        channel.update_context(|c| {
            c.requires_translation = true;
            c.variants = VariantCharacterSet::new("£à$");
        });
        channel.send_qsh(&CommandData::new("ls /QSYS.LIB/£LIB.LIB")).unwrap();
        assert_eq!(transport.calls()[0].stdin.as_deref(), Some("ls /QSYS.LIB/#LIB.LIB"));
    }

    #[test]
    fn test_ile_command_chain() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        let result = channel
            .run_command(&RemoteCommand::new(
                CommandEnvironment::Ile,
                "CRTBNDRPG PGM(&CURLIB/HELLO)\n\nDSPJOBLOG",
            ))
            .unwrap();

        assert_eq!(result.command.as_deref(), Some("CRTBNDRPG PGM(DEVLIB/HELLO)\n\nDSPJOBLOG"));
        let stdin = transport.calls()[0].stdin.clone().unwrap();
        assert_eq!(
            stdin,
            "liblist -d QGPL QTEMP && liblist -c DEVLIB && liblist -a \"#TOOLS\" QGPL && \
             system \"CRTBNDRPG PGM(DEVLIB/HELLO)\" && system \"DSPJOBLOG\""
        );
    }

    #[test]
    fn test_libl_override_is_deduplicated() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        let mut command = RemoteCommand::new(CommandEnvironment::Qsh, "echo &LIBLS");
        command.env.insert("&LIBL".to_string(), "A B A".to_string());
        command.env.insert("&CURLIB".to_string(), "CUR".to_string());
        channel.run_command(&command).unwrap();

        let stdin = transport.calls()[0].stdin.clone().unwrap();
        assert!(stdin.contains("liblist -c CUR && liblist -a B A && echo B A"));
    }

    #[test]
    fn test_pase_gets_variables_as_exports() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        channel
            .run_command(&RemoteCommand::new(CommandEnvironment::Pase, "echo $CURLIB"))
            .unwrap();
        assert!(transport.ran("CURLIB=\"DEVLIB\" export CURLIB"));
        assert!(!transport.ran("liblist"));
    }

    #[test]
    fn test_no_command_did_not_run() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        let result = channel
            .run_command(&RemoteCommand::new(CommandEnvironment::Ile, "  \n"))
            .unwrap();
        assert_eq!(result.code, DID_NOT_RUN);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_temp_remote_is_stable_per_key() {
        let channel = channel(ScriptedTransport::new());
        let first = channel.get_temp_remote("a");
        assert!(first.starts_with("/tmp/ibmitemp-O_"));
        assert_eq!(channel.get_temp_remote("a"), first);
        assert_ne!(channel.get_temp_remote("b"), first);
    }

    #[test]
    fn test_with_temp_directory_cleans_up() {
        let transport = ScriptedTransport::new();
        let channel = channel(transport.clone());
        let seen = channel.with_temp_directory(|dir| Ok(dir.to_string())).unwrap();
        assert!(transport.ran(&format!("mkdir -p {}", seen)));
        assert_eq!(transport.calls().last().unwrap().command, format!("rm -rf {}", seen));
    }

    #[test]
    fn test_escape_for_shell() {
        assert_eq!(escape_for_shell("a$b\"c"), "a\\$b\\\"c");
    }
}
