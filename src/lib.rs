//! Session layer for IBM i over SSH.
//!
//! A [`Connection`] opens the SSH transport and runs the connect handshake;
//! the resulting [`Session`] runs commands in the PASE, QSH and ILE
//! environments, runs SQL through the database CLI, and translates object
//! names between the American and Local variant alphabets.

pub mod command;
pub mod components;
pub mod config;
pub mod encoding;
pub mod error;
pub mod keychain;
pub mod logging;
pub mod session;
pub mod sql;
pub mod ssh;

pub use command::{CommandChannel, CommandData, CommandEnvironment, CommandResult, RemoteCommand};
pub use error::{AppError, AppResult};
pub use session::{
    ConnectOptions, ConnectResult, Connection, ConnectionCallbacks, ConnectionErrorCode, Session, SessionStores,
};
