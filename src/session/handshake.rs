use super::{
    fetch_asp_info, fetch_current_iasp, probe_features, probe_os_version, version_below, ConnectionCallbacks,
    ConnectionErrorCode, DebugConfig, MessageLevel, RemoteFeatureTable, Session, DEBUG_SERVICE_FEATURE,
};
use crate::command::{
    parse_messages, CommandData, CommandEnvironment, CommandResult, RemoteCommand, BASH_PATH, TEMP_FILE_PREFIX,
};
use crate::components::{ComponentContext, ComponentInstallState, FastShell, GetNewLibl, SqlToCsv};
use crate::config::{CachedServerSettings, DiscoveryStore};
use crate::encoding::{CcsidInfo, VariantCharacterSet, CCSID_NOCONVERSION, CCSID_SYSVAL};
use crate::error::{AppError, AppResult};
use crate::sql::{SqlEngine, DB2_FEATURE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const CHECK_SHELL_TEXT: &str = "This should be the only text!";
const PKGS_BIN: &str = "/QOpenSys/pkgs/bin";
const CHSH_PATH: &str = "/QOpenSys/pkgs/bin/chsh";
const LOCALE_MINIMUM_OS: &str = "7.4";

const VARIANT_QUERY: &str = "with VARIANTS ( HASH, AT, DOLLARSIGN ) as ( \
     values ( cast( x'7B' as varchar(1) ), cast( x'7C' as varchar(1) ), cast( x'5B' as varchar(1) ) ) \
     ) select HASH concat AT concat DOLLARSIGN as LOCAL from VARIANTS";

static PATH_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^((?:export )?PATH=)(.*)$").unwrap());

type Deferred = Box<dyn FnOnce(&Session) -> AppResult<()> + Send>;

/// Libraries reported by `liblist`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LibraryListing {
    pub current_library: Option<String>,
    pub user_libraries: Vec<String>,
}

/// Rows are the library padded to ten characters, two spaces, then the
/// portion (`SYS`, `PRD`, `CUR`, `USR`)
pub(crate) fn parse_liblist(output: &str) -> LibraryListing {
    let mut listing = LibraryListing::default();
    for line in output.split('\n') {
        let library: String = line.chars().take(10).collect();
        let portion: String = line.chars().skip(12).collect();
        match portion.trim() {
            "USR" => listing.user_libraries.push(library.trim().to_string()),
            "CUR" => listing.current_library = Some(library.trim().to_string()),
            _ => {}
        }
    }
    listing
}

/// Libraries of `configured` named in a `liblist -a` diagnostic
pub(crate) fn bad_libraries(stderr: &str, configured: &[String]) -> Vec<String> {
    let mut bad = vec![];
    for line in stderr.split('\n') {
        if let Some(library) = configured.iter().find(|lib| line.contains(&format!("ibrary {} ", lib))) {
            if !bad.contains(library) {
                bad.push(library.clone());
            }
        }
    }
    bad
}

/// Why `$PATH` needs fixing, if it does
pub(crate) fn path_problem(path: &str) -> Option<&'static str> {
    let entries: Vec<&str> = path.trim().split(':').collect();
    let Some(pkgs) = entries.iter().position(|entry| *entry == PKGS_BIN) else {
        return Some("Your $PATH shell environment variable does not include /QOpenSys/pkgs/bin");
    };

    let behind = |directory: &str| entries.iter().position(|entry| *entry == directory).map_or(false, |i| pkgs > i);
    if behind("/usr/bin") || behind("/QOpenSys/usr/bin") {
        Some("/QOpenSys/pkgs/bin is not in the right position in your $PATH shell environment variable")
    } else {
        None
    }
}

/// Move `/QOpenSys/pkgs/bin` to the front of the first PATH assignment, or
/// append one when there is none
pub(crate) fn fix_bashrc(content: &str) -> String {
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    let mut replaced = false;

    for line in lines.iter_mut() {
        let fixed = PATH_ASSIGNMENT.captures(line).map(|captures| {
            let rest: Vec<&str> = captures[2].split(':').filter(|entry| *entry != PKGS_BIN).collect();
            if rest.is_empty() {
                format!("{}{}", &captures[1], PKGS_BIN)
            } else {
                format!("{}{}:{}", &captures[1], PKGS_BIN, rest.join(":"))
            }
        });
        if let Some(fixed) = fixed {
            *line = fixed;
            replaced = true;
            break;
        }
    }

    if !replaced {
        lines.push(String::new());
        lines.push("# Generated by ibmi-session".to_string());
        lines.push(format!("export PATH={}:$PATH", PKGS_BIN));
    }

    lines.join("\n")
}

fn fix_bashrc_file(session: &Session, bashrc: &str, exists: bool, owner: &str) -> AppResult<()> {
    let channel = session.channel();
    info!("{} {}", if exists { "update" } else { "create" }, bashrc);

    if exists {
        let content = channel.read_text(bashrc)?;
        return channel.write_text(bashrc, &fix_bashrc(&content));
    }

    let created = channel.send_command(&CommandData::new(format!(
        "echo \"# Generated by ibmi-session\nexport PATH={pkgs}:\\$PATH\" >> {file} && chown {owner} {file} && chmod 755 {file}",
        pkgs = PKGS_BIN,
        file = bashrc,
        owner = owner
    )))?;
    if created.code != 0 {
        return Err(AppError::ShellConfig(format!("Error creating {}: {}", bashrc, created.stderr)));
    }
    Ok(())
}

/// The ordered connect sequence over a freshly opened transport
pub(crate) struct Handshake<'a> {
    session: &'a Session,
    callbacks: &'a dyn ConnectionCallbacks,
    discovery: &'a dyn DiscoveryStore,
    cancelled: &'a AtomicBool,
    /// Discovery cache, present only for a quick connect
    cached: Option<CachedServerSettings>,
    quick_connect: bool,
    job_current_library: String,
    temp_library_set: bool,
    error_codes: Vec<ConnectionErrorCode>,
    deferred: Vec<Deferred>,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(
        session: &'a Session,
        callbacks: &'a dyn ConnectionCallbacks,
        discovery: &'a dyn DiscoveryStore,
        cancelled: &'a AtomicBool,
        cached: Option<CachedServerSettings>,
        quick_connect: bool,
    ) -> Self {
        Self {
            session,
            callbacks,
            discovery,
            cancelled,
            cached: cached.filter(|_| quick_connect),
            quick_connect,
            job_current_library: "QGPL".to_string(),
            temp_library_set: false,
            error_codes: vec![],
            deferred: vec![],
        }
    }

    pub(crate) fn error_codes(&self) -> Vec<ConnectionErrorCode> {
        self.error_codes.clone()
    }

    /// Run every step. `on_shell_verified` fires once the shell check passed.
    pub(crate) fn run(&mut self, on_shell_verified: &dyn Fn()) -> AppResult<()> {
        self.check_cancelled()?;
        self.check_shell()?;
        on_shell_verified();

        self.check_cancelled()?;
        self.check_home_directory()?;

        self.check_cancelled()?;
        self.discover_features()?;

        self.check_cancelled()?;
        self.load_library_list()?;
        self.check_temp_library()?;
        self.check_temp_directory()?;
        self.clear_temp_data();

        self.check_cancelled()?;
        self.start_components();

        self.check_cancelled()?;
        self.check_bad_data_areas()?;
        self.check_shell_and_path()?;
        self.check_auto_convert();
        self.validate_library_list()?;
        self.load_debug_config();
        self.check_maximum_args_length()?;

        self.check_cancelled()?;
        self.negotiate_sql()?;

        self.check_cancelled()?;
        self.run_deferred();
        self.write_cache();
        Ok(())
    }

    fn check_cancelled(&self) -> AppResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn progress(&self, message: &str) {
        info!("{}", message);
        self.callbacks.progress(message);
    }

    /// Record a named condition; true when the remediation was accepted
    fn report(&mut self, code: ConnectionErrorCode, payload: serde_json::Value) -> bool {
        warn!("Connection warning {}: {}", code, payload);
        if !self.error_codes.contains(&code) {
            self.error_codes.push(code);
        }
        self.callbacks.on_connection_error(code, &payload)
    }

    fn send(&self, command: impl Into<String>) -> AppResult<CommandResult> {
        self.session.channel().send_command(&CommandData::new(command))
    }

    fn succeeds(&self, command: impl Into<String>) -> AppResult<bool> {
        Ok(self.send(command)?.code == 0)
    }

    /// CL command with the library list left alone
    fn run_ile(&self, command: impl Into<String>) -> AppResult<CommandResult> {
        let mut command = RemoteCommand::new(CommandEnvironment::Ile, command);
        command.no_lib_list = true;
        self.session.channel().run_command(&command)
    }

    fn check_shell(&mut self) -> AppResult<()> {
        self.progress("Checking shell output.");
        let result = self.session.channel().send_command(
            &CommandData::new(format!("echo \"{}\"", CHECK_SHELL_TEXT)).in_directory("."),
        )?;

        if result.stdout.split('\n').next() != Some(CHECK_SHELL_TEXT) {
            self.report(ConnectionErrorCode::ShellConfig, json!({ "output": result.stdout }));
            return Err(AppError::ShellConfig(
                "the login shell prints additional output, connection aborted".to_string(),
            ));
        }
        Ok(())
    }

    fn check_home_directory(&mut self) -> AppResult<()> {
        self.progress("Checking home directory.");
        let channel = self.session.channel().clone();

        let echoed = channel.send_command(&CommandData::new("echo $HOME && cd && test -w $HOME").in_directory("."))?;
        let mut home = None;

        if echoed.code == 0 {
            home = Some(echoed.stdout.trim().to_string());
        } else {
            let actual = echoed.stdout.trim().to_string();

            if self.succeeds(format!("test -e {}", actual))? {
                let reason = if !self.succeeds(format!("test -d {}", actual))? {
                    "is not a directory"
                } else if !self.succeeds(format!("test -w {}", actual))? {
                    "is not writable"
                } else if !self.succeeds(format!("test -x {}", actual))? {
                    "is not usable due to permissions"
                } else {
                    "exists but is unusable"
                };
                self.report(
                    ConnectionErrorCode::InvalidHomeDirectory,
                    json!({ "path": actual, "reason": reason }),
                );
            } else if self.report(ConnectionErrorCode::HomeDirectoryCreation, json!({ "path": actual })) {
                let owner = channel.context().username.to_lowercase();
                let created = channel.send_command(
                    &CommandData::new(format!(
                        "mkdir -p {dir} && chown {owner} {dir} && chmod 0755 {dir}",
                        dir = actual,
                        owner = owner
                    ))
                    .in_directory("."),
                )?;
                if created.code == 0 {
                    home = Some(actual);
                } else {
                    self.callbacks.message(
                        MessageLevel::Warning,
                        &format!("Error creating home directory ({}):\n{}", actual, created.stderr),
                    );
                }
            }
        }

        let home = home.filter(|h| !h.is_empty()).unwrap_or_else(|| ".".to_string());
        let previous = self.session.settings().home_directory;
        if home != "." && previous != "." && previous != home {
            self.callbacks
                .message(MessageLevel::Info, &format!("Configured home directory reset to {}.", home));
        }
        self.session.update_settings(|s| s.home_directory = home.clone());
        channel.update_context(|c| c.home_directory = home);
        Ok(())
    }

    fn discover_features(&mut self) -> AppResult<()> {
        let mut features = RemoteFeatureTable::expected();
        let fingerprint = features.fingerprint();
        let cached = self
            .cached
            .as_ref()
            .filter(|c| c.remote_features_keys.as_deref() == Some(fingerprint.as_str()));

        let os_version = match cached {
            Some(cached) => {
                debug!("Using cached remote features");
                features.merge(&cached.remote_features);
                cached.os_version.clone()
            }
            None => {
                self.progress("Checking installed components on host IBM i.");
                features = probe_features(self.session.channel());
                probe_os_version(self.session.channel())?
            }
        };

        let db2_path = features.get(DB2_FEATURE).map(str::to_string);
        let enable_sql = self.session.settings().enable_sql;
        if db2_path.is_none() {
            if enable_sql {
                self.progress("SQL program not installed. Disabling SQL.");
                self.session.update_settings(|s| s.enable_sql = false);
            }
            self.report(ConnectionErrorCode::NoSqlRunner, json!({ "feature": DB2_FEATURE }));
        }

        self.session.sql().update_environment(|e| {
            e.enabled = enable_sql && db2_path.is_some();
            e.db2_path = db2_path;
        });
        self.session.update_facts(|f| {
            f.features = features;
            f.os_version = os_version;
        });
        Ok(())
    }

    fn load_library_list(&mut self) -> AppResult<()> {
        self.progress("Checking library list configuration.");
        let channel = self.session.channel();
        let result = channel.send_qsh(&CommandData::new("liblist"))?;

        let mut user_libraries = vec![];
        if result.code == 0 && !result.stdout.is_empty() {
            let listing = parse_liblist(&result.stdout);
            if let Some(current) = listing.current_library {
                self.job_current_library = current;
            }
            user_libraries = listing.user_libraries;

            let current = self.job_current_library.clone();
            let defaults = user_libraries.clone();
            self.session.update_settings(|s| {
                if s.current_library.is_empty() {
                    s.current_library = current;
                }
                if s.library_list.is_empty() {
                    s.library_list = defaults;
                }
            });
        }

        channel.update_context(|c| c.default_user_libraries = user_libraries);
        Ok(())
    }

    fn check_temp_library(&mut self) -> AppResult<()> {
        self.progress("Checking temporary library configuration.");
        let temp_library = self.session.settings().temp_library;

        let created = self.run_ile(format!(
            "CRTLIB LIB({}) TEXT('ibmi-session temporary objects. May be cleared.')",
            temp_library
        ))?;
        let mut set = created.code == 0;

        if !set {
            let messages = parse_messages(&created.stderr);
            if messages.find_id("CPF2158").is_some() || messages.find_id("CPF2111").is_some() {
                set = true;
            } else if messages.find_id("CPD0032").is_some() {
                let exists = self.run_ile(format!("CHKOBJ OBJ(QSYS/{}) OBJTYPE(*LIB)", temp_library))?;
                let current = self.job_current_library.clone();
                if exists.code == 0 {
                    set = true;
                } else if !current.is_empty() && !current.starts_with('Q') {
                    info!("Using {} as the temporary library", current);
                    self.session.update_settings(|s| s.temp_library = current);
                    set = true;
                }
            }
        }

        if !set {
            self.report(ConnectionErrorCode::InvalidTempLib, json!({ "library": temp_library }));
        }
        self.temp_library_set = set;
        Ok(())
    }

    fn check_temp_directory(&mut self) -> AppResult<()> {
        self.progress("Checking temporary directory configuration.");
        let temp_dir = self.session.settings().temp_dir;

        let set = self.succeeds(format!("[ -d \"{}\" ]", temp_dir))? || self.succeeds(format!("mkdir -p {}", temp_dir))?;
        if !set {
            warn!("Temporary directory {} is unusable, using /tmp", temp_dir);
            self.session.update_settings(|s| s.temp_dir = "/tmp".to_string());
        }

        let settings = self.session.settings();
        self.session.channel().update_context(|c| {
            c.temp_library = settings.temp_library.clone();
            c.temp_dir = settings.temp_dir.clone();
        });
        Ok(())
    }

    /// Fire and forget; readiness does not wait for the purge
    fn clear_temp_data(&self) {
        let settings = self.session.settings();
        if !self.temp_library_set || !settings.auto_clear_temp_data {
            return;
        }
        self.progress("Clearing temporary data.");

        let channel = self.session.channel().clone();
        let spawned = std::thread::Builder::new()
            .name("temp-purge".to_string())
            .spawn(move || {
                let mut command = RemoteCommand::new(
                    CommandEnvironment::Ile,
                    format!("DLTOBJ OBJ({}/O_*) OBJTYPE(*FILE)", settings.temp_library),
                );
                command.no_lib_list = true;
                match channel.run_command(&command) {
                    Ok(result) if !result.stderr.is_empty() && !result.stderr.starts_with("CPF2125") => {
                        warn!("Temporary data not cleared from {}: {}", settings.temp_library, result.stderr)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Temporary data not cleared from {}: {}", settings.temp_library, e),
                }

                let pattern = format!("{}/{}*", settings.temp_dir.trim_end_matches('/'), TEMP_FILE_PREFIX);
                if let Err(e) = channel.send_command(&CommandData::new(format!("rm -f {}", pattern))) {
                    warn!("Temporary data not cleared from {}: {}", settings.temp_dir, e);
                }
            });
        if let Err(e) = spawned {
            warn!("Could not start the temporary data purge: {}", e);
        }
    }

    fn start_components(&mut self) {
        self.progress("Checking remote components.");
        let session = self.session;
        let settings = session.settings();
        let components = session.components();

        if let Some(shell) = components.get_as::<FastShell>(FastShell::ID, true) {
            if let Some(asset) = settings.fast_shell_asset.clone() {
                shell.set_local_asset(asset);
            }
        }
        if let Some(libl) = components.get_as::<GetNewLibl>(GetNewLibl::ID, true) {
            libl.set_temp_library(&settings.temp_library);
        }
        if let Some(export) = components.get_as::<SqlToCsv>(SqlToCsv::ID, true) {
            export.set_temp_locations(&settings.temp_library, &settings.temp_dir);
        }

        let last_installed = if self.quick_connect {
            self.discovery.component_states(session.name()).unwrap_or_else(|e| {
                warn!("Could not read component states: {}", e);
                vec![]
            })
        } else {
            vec![]
        };

        let discovery = self.discovery;
        let context = ComponentContext {
            channel: session.channel(),
            sql: session.sql(),
        };
        components.startup(&context, &last_installed, &|state: &ComponentInstallState| {
            if let Err(e) = discovery.store_component_state(session.name(), state) {
                warn!("Could not store state of {}: {}", state.id, e);
            }
        });

        let fast_shell = components
            .get_as::<FastShell>(FastShell::ID, false)
            .map(|shell| shell.install_path());
        session.channel().update_context(|c| c.fast_shell = fast_shell);
    }

    fn check_bad_data_areas(&mut self) -> AppResult<()> {
        if self.cached.as_ref().map_or(false, |c| c.bad_data_areas_checked) {
            return Ok(());
        }
        self.progress("Checking for bad data areas.");

        for (area, code) in [
            ("QCPTOIMPF", ConnectionErrorCode::QcptoimpfExists),
            ("QCPFRMIMPF", ConnectionErrorCode::QcpfrmimpfExists),
        ] {
            let found = self.run_ile(format!("CHKOBJ OBJ(QSYS/{}) OBJTYPE(*DTAARA)", area))?;
            if found.code != 0 {
                continue;
            }

            if self.report(code, json!({ "library": "QSYS", "object": area })) {
                let deleted = self.run_ile(format!("DLTOBJ OBJ(QSYS/{}) OBJTYPE(*DTAARA)", area))?;
                if deleted.code == 0 {
                    self.callbacks
                        .message(MessageLevel::Info, &format!("The data area QSYS/{} has been deleted.", area));
                } else {
                    self.callbacks.message(
                        MessageLevel::Warning,
                        &format!("Failed to delete the data area QSYS/{}: {}", area, deleted.stderr),
                    );
                }
            }
        }
        Ok(())
    }

    fn check_shell_and_path(&mut self) -> AppResult<()> {
        let features = self.session.facts().features;
        if !features.has("bash") {
            return Ok(());
        }

        let shell = self.send("echo $SHELL")?;
        if !shell.stderr.is_empty() {
            return Ok(());
        }
        let login_shell = shell.stdout.trim().to_string();
        self.session
            .channel()
            .update_context(|c| c.shell = Some(login_shell.clone()));

        let mut uses_bash = login_shell == BASH_PATH;
        if !uses_bash
            && features.has("chsh")
            && self.report(ConnectionErrorCode::DefaultNotBash, json!({ "shell": login_shell }))
        {
            let changed = self.send(format!("{} -s {}", CHSH_PATH, BASH_PATH))?;
            if changed.stderr.is_empty() {
                self.callbacks.message(
                    MessageLevel::Info,
                    "Shell is now bash! Reconnect for change to take effect.",
                );
                uses_bash = true;
            } else {
                self.callbacks
                    .message(MessageLevel::Warning, "Default shell WAS NOT changed to bash.");
            }
        }

        if !uses_bash {
            return Ok(());
        }

        self.progress("Checking /QOpenSys/pkgs/bin in $PATH.");
        if self.cached.as_ref().map_or(false, |c| c.path_checked) {
            return Ok(());
        }

        let path = self.send("echo $PATH")?.stdout;
        let context = self.session.channel().context();
        let bashrc = format!("{}/.bashrc", context.home_directory.trim_end_matches('/'));
        let exists = self.succeeds(format!("test -e {}", bashrc))?;

        if let Some(reason) = path_problem(&path) {
            let payload = json!({ "reason": reason, "bashrc": bashrc, "exists": exists });
            if self.report(ConnectionErrorCode::InvalidBashrc, payload) {
                let owner = context.username.to_lowercase();
                self.deferred
                    .push(Box::new(move |session: &Session| fix_bashrc_file(session, &bashrc, exists, &owner)));
            }
        }
        Ok(())
    }

    fn check_auto_convert(&mut self) {
        let features = self.session.facts().features;
        if self.session.settings().auto_convert_ifs_ccsid && !(features.has("attr") && features.has("iconv")) {
            self.session.update_settings(|s| s.auto_convert_ifs_ccsid = false);
            self.report(
                ConnectionErrorCode::NoAutoConvEbcdic,
                json!({ "attr": features.get("attr"), "iconv": features.get("iconv") }),
            );
        }
    }

    fn validate_library_list(&mut self) -> AppResult<()> {
        if self.cached.as_ref().map_or(false, |c| c.library_list_validated) {
            return Ok(());
        }
        let configured = self.session.settings().library_list;
        if configured.is_empty() {
            return Ok(());
        }
        self.progress("Validate configured library list");

        let defaults = self.session.channel().context().default_user_libraries;
        let mut commands = vec![format!("liblist -d {}", defaults.join(" ").replace('$', "\\$"))];
        commands.extend(configured.iter().map(|lib| format!("liblist -a {}", lib.replace('$', "\\$"))));

        let result = self
            .session
            .channel()
            .send_qsh(&CommandData::new(commands.join("; ")))?;
        let bad = bad_libraries(&result.stderr, &configured);
        if bad.is_empty() {
            return Ok(());
        }

        if self.report(ConnectionErrorCode::InvalidLibraries, json!({ "libraries": bad })) {
            self.session
                .update_settings(|s| s.library_list.retain(|lib| !bad.contains(lib)));
        } else {
            self.callbacks.message(
                MessageLevel::Warning,
                &format!("The following libraries do not exist: {}.", bad.join(",")),
            );
        }
        Ok(())
    }

    fn load_debug_config(&mut self) {
        if !self.session.facts().features.has(DEBUG_SERVICE_FEATURE) {
            return;
        }

        if let Some(cached) = self.cached.as_ref().filter(|c| c.debug_config_loaded) {
            let config = DebugConfig::from_map(&cached.debug_config);
            self.session.update_facts(|f| f.debug_config = Some(config));
            return;
        }

        match DebugConfig::load(self.session.channel()) {
            Ok(config) => self.session.update_facts(|f| f.debug_config = Some(config)),
            Err(e) => {
                self.report(ConnectionErrorCode::NotLoadedDebugConfig, json!({ "error": e.to_string() }));
            }
        }
    }

    fn check_maximum_args_length(&mut self) -> AppResult<()> {
        let length = match self.cached.as_ref().and_then(|c| c.maximum_args_length) {
            Some(length) => Some(length),
            None => {
                let result = self.send("getconf ARG_MAX")?;
                if result.code == 0 {
                    result.stdout.trim().parse().ok()
                } else {
                    None
                }
            }
        };
        debug!("Maximum argument length: {:?}", length);
        self.session.update_facts(|f| f.maximum_args_length = length);
        Ok(())
    }

    fn negotiate_sql(&mut self) -> AppResult<()> {
        let session = self.session;
        let sql = session.sql();
        if !sql.is_available() {
            return Ok(());
        }

        let asps = match self.cached.as_ref() {
            Some(cached) => cached.i_asp_info.clone(),
            None => {
                self.progress("Checking for ASP information.");
                fetch_asp_info(sql).unwrap_or_else(|e| {
                    warn!("Failed to get ASP information: {}", e);
                    vec![]
                })
            }
        };
        let current_iasp = if asps.is_empty() {
            None
        } else {
            fetch_current_iasp(sql, &asps).unwrap_or_else(|e| {
                warn!("Could not resolve the current iASP: {}", e);
                None
            })
        };
        session.update_facts(|f| {
            f.asps = asps;
            f.current_iasp = current_iasp;
        });

        let restored = self.cached.as_ref().and_then(|cached| {
            Some((
                CcsidInfo {
                    qccsid: cached.qccsid?,
                    job_ccsid: cached.job_ccsid?,
                    user_default_ccsid: cached.user_default_ccsid.unwrap_or(0),
                    sshd_ccsid: cached.sshd_ccsid,
                },
                VariantCharacterSet::from_chars(cached.variant_chars.as_ref()?),
            ))
        });

        let (ccsid, variants) = match restored {
            Some(restored) => restored,
            None => {
                self.progress("Fetching conversion values.");
                let ccsid = fetch_ccsids(sql, &session.channel().context().username);
                sql.update_environment(|e| e.ccsid = ccsid);

                self.progress("Fetching local encoding values.");
                let variants = match fetch_local_variants(sql) {
                    Some(local) => VariantCharacterSet::new(&local),
                    None => VariantCharacterSet::default(),
                };
                self.check_locale()?;
                (ccsid, variants)
            }
        };

        let fast_shell_installed = session.channel().context().fast_shell.is_some();
        let requires_translation = ccsid.requires_translation(fast_shell_installed);
        debug!("CCSIDs {:?}, translation required: {}", ccsid, requires_translation);

        session.channel().update_context(|c| {
            c.requires_translation = requires_translation;
            c.variants = variants;
        });
        sql.update_environment(|e| {
            e.ccsid = ccsid;
            e.requires_translation = requires_translation;
        });
        session.update_facts(|f| {
            f.ccsid = Some(ccsid);
            f.requires_translation = requires_translation;
        });

        let settings = session.settings();
        if ccsid.qccsid == CCSID_NOCONVERSION {
            if settings.enable_sql {
                session.update_settings(|s| s.enable_sql = false);
                sql.update_environment(|e| e.enabled = false);
            }
            self.report(
                ConnectionErrorCode::CcsidWarning,
                json!({ "qccsid": ccsid.qccsid, "sqlDisabled": true }),
            );
        } else if settings.show_ccsid_warnings && ccsid.encoding().invalid {
            self.report(
                ConnectionErrorCode::CcsidWarning,
                json!({ "jobCcsid": ccsid.job_ccsid, "userDefaultCcsid": ccsid.user_default_ccsid }),
            );
        }
        Ok(())
    }

    fn check_locale(&mut self) -> AppResult<()> {
        let Some(os_version) = self.session.facts().os_version else {
            return Ok(());
        };
        if !version_below(&os_version, LOCALE_MINIMUM_OS) {
            return Ok(());
        }

        let lang = self.send("echo $LANG")?.stdout;
        if !lang.to_uppercase().contains("UTF-8") {
            self.report(
                ConnectionErrorCode::InvalidLocale,
                json!({ "lang": lang, "osVersion": os_version }),
            );
        }
        Ok(())
    }

    fn run_deferred(&mut self) {
        for operation in std::mem::take(&mut self.deferred) {
            if let Err(e) = operation(self.session) {
                warn!("Deferred operation failed: {}", e);
                self.callbacks.message(MessageLevel::Warning, &e.to_string());
            }
        }
    }

    fn write_cache(&self) {
        let session = self.session;
        let facts = session.facts();
        let context = session.channel().context();

        let cache = CachedServerSettings {
            last_checked_on_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            i_asp_info: facts.asps.clone(),
            qccsid: facts.ccsid.map(|c| c.qccsid),
            job_ccsid: facts.ccsid.map(|c| c.job_ccsid),
            user_default_ccsid: facts.ccsid.map(|c| c.user_default_ccsid),
            sshd_ccsid: facts.ccsid.and_then(|c| c.sshd_ccsid),
            remote_features_keys: Some(facts.features.fingerprint()),
            remote_features: facts.features,
            variant_chars: facts.ccsid.map(|_| context.variants.to_chars()),
            bad_data_areas_checked: true,
            library_list_validated: true,
            path_checked: true,
            debug_config_loaded: facts.debug_config.is_some(),
            debug_config: facts.debug_config.map(|c| c.to_map()).unwrap_or_default(),
            maximum_args_length: facts.maximum_args_length,
            os_version: facts.os_version,
        };

        if let Err(e) = self.discovery.set_server_settings(session.name(), &cache) {
            warn!("Could not write the discovery cache: {}", e);
        }
    }
}

fn first_number(sql: &SqlEngine, statement: &str, column: &str) -> Option<i32> {
    match sql.query(statement) {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.get(column))
            .and_then(|value| value.as_i64())
            .map(|value| value as i32),
        Err(e) => {
            warn!("Could not read {}: {}", column, e);
            None
        }
    }
}

/// System, profile and job CCSIDs. The profile CCSID stands in for the job
/// CCSID; `*SYSVAL` resolves to QCCSID. sshd's own CCSID falls back to the
/// job CCSID.
fn fetch_ccsids(sql: &SqlEngine, username: &str) -> CcsidInfo {
    let qccsid = first_number(
        sql,
        "select SYSTEM_VALUE_NAME, CURRENT_NUMERIC_VALUE from QSYS2.SYSTEM_VALUE_INFO where SYSTEM_VALUE_NAME = 'QCCSID'",
        "CURRENT_NUMERIC_VALUE",
    )
    .unwrap_or(0);

    let job_ccsid = first_number(
        sql,
        &format!(
            "select CHARACTER_CODE_SET_ID from table( QSYS2.QSYUSRINFO( USERNAME => upper('{}') ) )",
            username.replace('\'', "''")
        ),
        "CHARACTER_CODE_SET_ID",
    )
    .filter(|ccsid| *ccsid != CCSID_SYSVAL)
    .unwrap_or(qccsid);

    let user_default_ccsid = first_number(
        sql,
        "select DEFAULT_CCSID from table( QSYS2.ACTIVE_JOB_INFO( JOB_NAME_FILTER => '*', DETAILED_INFO => 'ALL' ) )",
        "DEFAULT_CCSID",
    )
    .unwrap_or(0);

    let sshd_ccsid = first_number(
        sql,
        "select CCSID from table( QSYS2.ACTIVE_JOB_INFO( SUBSYSTEM_LIST_FILTER => 'QUSRWRK', DETAILED_INFO => 'ALL' ) ) where FUNCTION = 'sshd' fetch first 1 rows only",
        "CCSID",
    )
    .or(Some(job_ccsid));

    CcsidInfo {
        qccsid,
        job_ccsid,
        user_default_ccsid,
        sshd_ccsid,
    }
}

/// The Local variant alphabet, read back from the code points of `#@$`
fn fetch_local_variants(sql: &SqlEngine) -> Option<String> {
    match sql.query(VARIANT_QUERY) {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.get("LOCAL"))
            .and_then(|value| value.as_str())
            .map(str::to_string),
        Err(e) => {
            warn!("Could not probe the variant characters: {}", e);
            None
        }
    }
}
