use std::path::PathBuf;

use thiserror::Error;

use crate::daemon::protocol::Status;

/// Process exit codes shared by both binaries.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const USAGE: i32 = 2;
}

#[derive(Error, Debug)]
pub enum RolegateError {
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance appears to be running: pid file {0} exists")]
    PidFileExists(PathBuf),

    #[error("no pid file found for system '{0}'")]
    NotRunning(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provisioning refused: {0}")]
    Refused(Status),

    #[error("signal handling failed: {0}")]
    Signal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RolegateError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors (bad names, bad configuration)
            RolegateError::InvalidName { .. } | RolegateError::Config(_) => exit_codes::USAGE,

            // Everything else is an operational failure
            RolegateError::PidFileExists(_)
            | RolegateError::NotRunning(_)
            | RolegateError::Connect { .. }
            | RolegateError::Protocol(_)
            | RolegateError::Refused(_)
            | RolegateError::Signal(_)
            | RolegateError::Io(_)
            | RolegateError::Toml(_) => exit_codes::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, RolegateError>;
