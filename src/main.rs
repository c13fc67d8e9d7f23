//! Command line front end: connect to a configured profile, then run one
//! command or SQL script.

use anyhow::{bail, Context};
use ibmi_session::config::{get_config_dir, get_logs_dir, ConnectionProfile, ProfileManager};
use ibmi_session::keychain::password_key;
use ibmi_session::logging::CommandLog;
use ibmi_session::session::MessageLevel;
use ibmi_session::ssh::{HostKeyDecision, HostKeyInfo};
use ibmi_session::{
    CommandEnvironment, ConnectOptions, Connection, ConnectionCallbacks, ConnectionErrorCode, RemoteCommand,
    SessionStores,
};
use std::io::BufRead;
use std::sync::Arc;

#[derive(Debug, clap::Parser)]
#[clap(about = "Run commands and SQL on IBM i over SSH", long_about = None)]
struct Args {
    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Add or replace a connection profile
    AddProfile {
        name: String,
        host: String,
        username: String,
        #[clap(long, default_value_t = 22)]
        port: u16,
    },
    /// List configured profiles
    Profiles,
    /// Store the password of a profile, read from stdin
    SetPassword { name: String },
    /// Run a command in one of the three environments
    Run {
        name: String,
        /// pase, qsh or ile
        #[clap(long, default_value = "ile")]
        env: String,
        command: String,
        #[clap(flatten)]
        connect: ConnectArgs,
    },
    /// Run an SQL script and print the rows of its last statement as JSON
    Sql {
        name: String,
        statements: String,
        #[clap(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(Debug, clap::Args)]
struct ConnectArgs {
    /// Probe the system again instead of replaying the discovery cache
    #[clap(long)]
    reload: bool,
    /// Record an unknown host key instead of rejecting it
    #[clap(long)]
    trust_host: bool,
    /// Accept every remediation the handshake offers
    #[clap(long)]
    fix: bool,
}

struct CliCallbacks {
    trust_host: bool,
    fix: bool,
}

impl ConnectionCallbacks for CliCallbacks {
    fn progress(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn message(&self, level: MessageLevel, text: &str) {
        eprintln!("[{:?}] {}", level, text);
    }

    fn on_connection_error(&self, code: ConnectionErrorCode, payload: &serde_json::Value) -> bool {
        eprintln!("warning: {} {}", code, payload);
        self.fix
    }

    fn confirm_host_key(&self, info: &HostKeyInfo) -> HostKeyDecision {
        eprintln!("Host key of {}:{} is {} {}", info.host, info.port, info.key_type, info.fingerprint_sha256);
        if self.trust_host {
            HostKeyDecision::TrustAlways
        } else {
            HostKeyDecision::Reject
        }
    }

    fn on_disconnected(&self) {
        eprintln!("Connection lost");
    }
}

fn parse_environment(env: &str) -> anyhow::Result<CommandEnvironment> {
    Ok(match env.to_lowercase().as_str() {
        "pase" => CommandEnvironment::Pase,
        "qsh" => CommandEnvironment::Qsh,
        "ile" => CommandEnvironment::Ile,
        other => bail!("unknown environment {:?}, expected pase, qsh or ile", other),
    })
}

fn connect(name: &str, args: &ConnectArgs) -> anyhow::Result<Connection> {
    let config_dir = get_config_dir()?;
    std::fs::create_dir_all(&config_dir).with_context(|| format!("creating {:?}", config_dir))?;

    let profile = ProfileManager::load(&config_dir)?.get(name)?;
    let log = CommandLog::open(&get_logs_dir()?, name).context("opening the command log")?;
    let connection = Connection::new(profile, SessionStores::open(&config_dir)).with_sink(log);

    let callbacks = Arc::new(CliCallbacks {
        trust_host: args.trust_host,
        fix: args.fix,
    });
    let options = ConnectOptions {
        reload_server_settings: args.reload,
        ..Default::default()
    };

    let result = connection.connect(callbacks, &options);
    if !result.success {
        bail!(
            "could not connect to {}: {}",
            name,
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(connection)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config_dir = get_config_dir()?;

    match args.action {
        Action::AddProfile {
            name,
            host,
            username,
            port,
        } => {
            std::fs::create_dir_all(&config_dir)?;
            let mut manager = ProfileManager::load(&config_dir)?;
            let mut profile = ConnectionProfile::new(&name, host, username);
            profile.port = port;
            if manager.get(&name).is_ok() {
                manager.update(profile)?;
            } else {
                manager.add(profile)?;
            }
            manager.save()?;
        }
        Action::Profiles => {
            for profile in ProfileManager::load(&config_dir)?.list() {
                println!("{}\t{}@{}:{}", profile.name, profile.username, profile.host, profile.port);
            }
        }
        Action::SetPassword { name } => {
            let mut password = String::new();
            std::io::stdin().lock().read_line(&mut password)?;
            let stores = SessionStores::open(&config_dir);
            stores.secrets.set(&password_key(&name), password.trim_end_matches(&['\r', '\n'][..]))?;
        }
        Action::Run {
            name,
            env,
            command,
            connect: connect_args,
        } => {
            let environment = parse_environment(&env)?;
            let connection = connect(&name, &connect_args)?;
            let result = connection
                .session()?
                .run_command(&RemoteCommand::new(environment, command))?;
            connection.end()?;

            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
            if result.code != 0 {
                std::process::exit(result.code);
            }
        }
        Action::Sql {
            name,
            statements,
            connect: connect_args,
        } => {
            let connection = connect(&name, &connect_args)?;
            let rows = connection.session()?.run_sql(&statements, &Default::default());
            connection.end()?;
            println!("{}", serde_json::to_string_pretty(&rows?)?);
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ibmi_session=info,warn".into()),
        )
        .init();

    let args = <Args as clap::Parser>::parse();
    if let Err(err) = run(args) {
        eprintln!("ibmi-session: fatal: {:#}", err);
        std::process::exit(1);
    }
}
