use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Rolegate - provisions PostgreSQL roles for directory-backed accounts
#[derive(Parser)]
#[command(name = "rolegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a running daemon to provision an account
    Provision {
        /// Account name to provision
        name: String,

        /// Host the daemon listens on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port the daemon listens on
        #[arg(long)]
        port: u16,
    },

    /// Report whether a daemon for the given system is running
    Status {
        /// System name the daemon was started with
        system: String,

        /// Directory holding the PID file
        #[arg(long, default_value = "/var/run/rolegated")]
        pid_dir: PathBuf,
    },

    /// Ask a running daemon to shut down
    Stop {
        /// System name the daemon was started with
        system: String,

        /// Directory holding the PID file
        #[arg(long, default_value = "/var/run/rolegated")]
        pid_dir: PathBuf,
    },
}
