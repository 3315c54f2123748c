//! Rolegate daemon - provisions database roles for directory accounts.
//!
//! The rolegated binary is the long-running service:
//! - Listens on a TCP port for candidate account names
//! - Confirms each name exists in the LDAP directory
//! - Idempotently creates the matching database role and grants it into
//!   the configured group
//! - Handles graceful shutdown on SIGINT/SIGQUIT/SIGTERM
//!
//! ## Usage
//!
//! `rolegated <system> <group> <database> <port>` with the connect
//! credentials in `ROLEGATE_CONNECT_USER` and `ROLEGATE_CONNECT_PASSWORD`.
//! The process daemonizes unless `--foreground` is given.
//!
//! ## Files
//!
//! - `<pid-dir>/<system>.pid` - PID file, refuses a second instance
//! - `<log-dir>/<system>.log.*` - daily-rotated daemon logs
//! - optional `--config` TOML file - directory/database endpoint tuning

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use rolegate::config::{Config, Tuning};
use rolegate::daemon::pidfile::PidFile;
use rolegate::daemon::supervisor;
use rolegate::services::directory::LdapDirectory;
use rolegate::services::provision::PgProvisioner;

#[derive(Parser)]
#[command(name = "rolegated")]
#[command(author, version, about = "LDAP-to-PostgreSQL account provisioning daemon")]
struct DaemonArgs {
    /// System name; keys the PID file and the log file
    system_name: String,

    /// PostgreSQL group role that provisioned accounts are granted into
    group_name: String,

    /// Database to provision access for
    database_name: String,

    /// TCP port to listen on for provisioning requests
    listen_port: u16,

    /// Role the daemon connects to the database as
    #[arg(long, env = "ROLEGATE_CONNECT_USER", hide_env_values = true)]
    connect_user: String,

    /// Password for the connect role
    #[arg(long, env = "ROLEGATE_CONNECT_PASSWORD", hide_env_values = true)]
    connect_password: String,

    /// Optional TOML file with directory/database endpoint tuning
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay in the foreground and log to stderr
    #[arg(long)]
    foreground: bool,

    /// Directory for the PID file
    #[arg(long, default_value = "/var/run/rolegated")]
    pid_dir: PathBuf,

    /// Directory for daemon logs
    #[arg(long, default_value = "/var/log/rolegated")]
    log_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = DaemonArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // before daemonization this reaches the terminal; afterwards
            // the log file has the details
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: DaemonArgs) -> anyhow::Result<()> {
    let tuning = Tuning::load(args.config.as_deref()).context("loading tuning file")?;

    let config = Config {
        system_name: args.system_name,
        group_name: args.group_name,
        database_name: args.database_name,
        connect_user: args.connect_user,
        connect_password: args.connect_password,
        listen_port: args.listen_port,
        directory: tuning.directory,
        database: tuning.database,
        net: tuning.net,
        pid_dir: args.pid_dir,
        log_dir: args.log_dir,
    };
    config.validate()?;

    // refuse to start when a previous instance left its pid file behind,
    // before any other resource is acquired
    PidFile::check_absent(&config.pid_dir, &config.system_name)?;

    // bind while errors still reach the terminal; the socket survives
    // daemonization
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
        .with_context(|| format!("binding port {}", config.listen_port))?;
    listener.set_nonblocking(true)?;

    if !args.foreground {
        // must happen before the runtime spawns threads
        supervisor::daemonize().context("daemonizing")?;
    }

    let log_guard = init_logging(&config, args.foreground)?;

    let result = serve(&config, listener);
    if let Err(err) = &result {
        tracing::error!(err = format!("{err:#}"), "rolegated failed");
    }
    // flush buffered log lines before the process exits
    drop(log_guard);
    result
}

fn serve(config: &Config, listener: TcpListener) -> anyhow::Result<()> {
    // the pid recorded is the post-daemonization one
    let _pid_file = PidFile::create(&config.pid_dir, &config.system_name, std::process::id())?;

    tracing::info!(
        system = %config.system_name,
        group = %config.group_name,
        database = %config.database_name,
        port = config.listen_port,
        "rolegated starting, version {}",
        env!("CARGO_PKG_VERSION")
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let directory = LdapDirectory::new(&config.directory);
        let provisioner = PgProvisioner::new(config);

        supervisor::supervise(listener, directory, provisioner, config.net).await
    })?;

    tracing::info!("rolegated shutdown complete");
    Ok(())
}

/// Initialize logging: stderr in the foreground, a non-blocking daily file
/// appender otherwise. The returned guard must stay alive so buffered log
/// lines are flushed on exit.
fn init_logging(config: &Config, foreground: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(
        &config.log_dir,
        format!("{}.log", config.system_name),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .init();

    Ok(Some(guard))
}
