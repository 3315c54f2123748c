//! Validated daemon configuration.
//!
//! The four positional names, the listen port, and the connect credentials
//! come from the command line and environment; endpoint tuning for the
//! directory and the database can additionally be loaded from an optional
//! TOML file. Everything is validated once at startup and is immutable for
//! the lifetime of the process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RolegateError};
use crate::services::retry::RetryPolicy;

/// Maximum length accepted for any configured name.
pub const NAME_LENGTH_MAX: usize = 96;

/// Immutable runtime configuration, shared by reference with the
/// connection handler and the provisioning services.
#[derive(Debug, Clone)]
pub struct Config {
    /// Names the PID file and the log file.
    pub system_name: String,
    /// PostgreSQL group role that provisioned accounts are granted into.
    pub group_name: String,
    /// Database the provisioner connects to.
    pub database_name: String,
    /// Role the daemon itself authenticates to the database as.
    pub connect_user: String,
    /// Password for `connect_user`. Never logged.
    pub connect_password: String,
    /// TCP port the provisioning protocol listens on.
    pub listen_port: u16,

    pub directory: DirectorySettings,
    pub database: DatabaseSettings,
    pub net: NetSettings,

    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Config {
    /// Check every name field against the shared alphabet rules.
    pub fn validate(&self) -> Result<()> {
        validate_name("system name", &self.system_name)?;
        validate_name("group name", &self.group_name)?;
        validate_name("database name", &self.database_name)?;
        validate_name("connect user", &self.connect_user)?;
        if self.directory.url.is_empty() {
            return Err(RolegateError::Config("directory url must not be empty".into()));
        }
        if !self.directory.entry_dn.contains("{name}") {
            return Err(RolegateError::Config(
                "directory entry_dn must contain the {name} placeholder".into(),
            ));
        }
        Ok(())
    }
}

/// Endpoint and retry tuning for the directory lookup client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// LDAP server URL.
    pub url: String,
    /// DN template for the exact-match existence search; `{name}` is
    /// replaced with the requested account name.
    pub entry_dn: String,
    /// Attempts per bind and per search before giving up.
    pub attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-attempt bind/search timeout, in milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            url: "ldaps://ldap.example.com:1636".to_string(),
            entry_dn: "uid={name},ou=users,ou=People".to_string(),
            attempts: 4,
            retry_delay_ms: 200,
            op_timeout_ms: 200,
        }
    }
}

impl DirectorySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn entry_dn_for(&self, name: &str) -> String {
        self.entry_dn.replace("{name}", name)
    }
}

/// Where and how the provisioner connects to PostgreSQL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    /// Connection establishment timeout, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5433,
            connect_timeout_secs: 2,
        }
    }
}

impl DatabaseSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Socket timeouts for the provisioning protocol. The service expects a
/// low-latency local network path, so these are deliberately short.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub linger_secs: u64,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 160,
            send_timeout_ms: 160,
            linger_secs: 2,
        }
    }
}

impl NetSettings {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }
}

/// The optional TOML tuning file: any of the sections may be present,
/// anything missing falls back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub directory: DirectorySettings,
    pub database: DatabaseSettings,
    pub net: NetSettings,
}

impl Tuning {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
        }
    }
}

/// Validate a configured name: ASCII alphanumeric plus interior `-` or `_`,
/// no leading or trailing separator, bounded length.
pub fn validate_name(field: &'static str, value: &str) -> Result<()> {
    let invalid = |reason| RolegateError::InvalidName {
        field,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > NAME_LENGTH_MAX {
        return Err(invalid("name is too long"));
    }
    if value
        .bytes()
        .any(|b| !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_'))
    {
        return Err(invalid("only alphanumerics, '-' and '_' are allowed"));
    }
    let first = value.as_bytes()[0];
    let last = value.as_bytes()[value.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(invalid("must not begin or end with '-' or '_'"));
    }
    Ok(())
}
