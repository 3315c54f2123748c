//! Process supervision: daemonization and the signal-driven control loop.
//!
//! After startup there are exactly two tasks: the connection handler's
//! accept loop and this supervisor, which blocks exclusively on signal
//! delivery. The two interact only through channels: a watch channel
//! carries the shutdown request to the handler, and an mpsc channel
//! carries a fatal handler fault back. Hangup and child-status signals are
//! logged no-ops; interrupt, quit, terminate and CPU-limit signals request
//! an orderly shutdown. Repeated failures of the signal machinery itself
//! are treated as fatal after a fixed budget.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::config::NetSettings;
use crate::daemon::server::Server;
use crate::error::{Result, RolegateError};
use crate::services::directory::Directory;
use crate::services::provision::Provisioner;

/// Consecutive signal-wait failures tolerated before giving up.
const SIGNAL_PROBLEM_MAX: u32 = 10;

/// How long the handler gets to observe shutdown and finish its current
/// request before it is aborted.
const HANDLER_GRACE: Duration = Duration::from_secs(5);

/// Spawn the connection handler and block on signals until shutdown.
///
/// Returns `Ok(())` for a signal-requested shutdown and an error when the
/// handler faulted or the signal machinery failed, so the caller can map
/// the two onto different exit codes.
pub async fn supervise<D, P>(
    listener: TcpListener,
    directory: D,
    provisioner: P,
    net: NetSettings,
) -> Result<()>
where
    D: Directory + Send + Sync + 'static,
    P: Provisioner + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fault_tx, mut fault_rx) = mpsc::channel::<RolegateError>(1);

    let server = Server::new(directory, provisioner, net, shutdown_rx);
    let mut handler = tokio::spawn(async move {
        if let Err(err) = server.serve(listener).await {
            // the channel hands the fault to the control loop; the handler
            // itself never takes the process down
            let _ = fault_tx.send(err).await;
        }
    });

    let outcome = wait_for_shutdown(&mut fault_rx).await;

    // request cooperative termination and give the handler time to finish
    // its in-flight request
    let _ = shutdown_tx.send(true);
    if timeout(HANDLER_GRACE, &mut handler).await.is_err() {
        tracing::warn!("connection handler ignored shutdown, aborting it");
        handler.abort();
    }

    outcome
}

/// Block until a shutdown-class signal arrives or the handler faults.
async fn wait_for_shutdown(faults: &mut mpsc::Receiver<RolegateError>) -> Result<()> {
    let mut sighup = hook(SignalKind::hangup())?;
    let mut sigint = hook(SignalKind::interrupt())?;
    let mut sigquit = hook(SignalKind::quit())?;
    let mut sigterm = hook(SignalKind::terminate())?;
    let mut sigchld = hook(SignalKind::child())?;
    let mut sigxcpu = hook(SignalKind::from_raw(libc::SIGXCPU))?;

    let mut problems = 0u32;

    loop {
        tokio::select! {
            fault = faults.recv() => match fault {
                Some(err) => {
                    tracing::error!(%err, "connection handler failed");
                    return Err(err);
                }
                // the handler ended without reporting a fault; shut down
                None => {
                    tracing::warn!("connection handler exited unexpectedly");
                    return Ok(());
                }
            },

            received = sighup.recv() => {
                if observed(received, "SIGHUP", &mut problems)? {
                    tracing::info!("SIGHUP ignored");
                }
            }
            received = sigchld.recv() => {
                if observed(received, "SIGCHLD", &mut problems)? {
                    tracing::debug!("SIGCHLD ignored");
                }
            }

            received = sigint.recv() => {
                if observed(received, "SIGINT", &mut problems)? {
                    tracing::info!("received SIGINT, shutting down");
                    return Ok(());
                }
            }
            received = sigquit.recv() => {
                if observed(received, "SIGQUIT", &mut problems)? {
                    tracing::info!("received SIGQUIT, shutting down");
                    return Ok(());
                }
            }
            received = sigterm.recv() => {
                if observed(received, "SIGTERM", &mut problems)? {
                    tracing::info!("received SIGTERM, shutting down");
                    return Ok(());
                }
            }
            received = sigxcpu.recv() => {
                if observed(received, "SIGXCPU", &mut problems)? {
                    tracing::info!("received SIGXCPU, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn hook(kind: SignalKind) -> Result<Signal> {
    signal(kind).map_err(|err| RolegateError::Signal(format!("failed to register handler: {err}")))
}

/// Track whether a signal stream delivered a value or failed. A closed
/// stream counts against the shared problem budget; exhausting the budget
/// is fatal.
fn observed(received: Option<()>, which: &str, problems: &mut u32) -> Result<bool> {
    match received {
        Some(()) => {
            *problems = 0;
            Ok(true)
        }
        None => {
            *problems += 1;
            tracing::error!(signal = which, count = *problems, "signal wait failed");
            if *problems >= SIGNAL_PROBLEM_MAX {
                return Err(RolegateError::Signal(
                    "signal wait failed too many times".into(),
                ));
            }
            Ok(false)
        }
    }
}

/// Detach from the controlling terminal and session.
///
/// Runs before the async runtime exists, while the process is still
/// single-threaded: fork, become session leader, chdir to `/`, and point
/// stdio at `/dev/null`. The caller must re-read its process id afterwards
/// for the PID file.
pub fn daemonize() -> std::io::Result<()> {
    // SAFETY: no other threads exist yet; fork/setsid/chdir/dup2 are the
    // standard detach sequence and are checked individually.
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _parent => libc::_exit(0),
        }

        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }

        if libc::chdir(c"/".as_ptr()) == -1 {
            return Err(std::io::Error::last_os_error());
        }

        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null == -1 {
            return Err(std::io::Error::last_os_error());
        }
        for fd in 0..=2 {
            if libc::dup2(null, fd) == -1 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if null > 2 {
            libc::close(null);
        }
    }

    Ok(())
}
