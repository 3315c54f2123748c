//! The `rolegate status` and `rolegate stop` commands.
//!
//! Both work from the PID file the daemon writes for its system name. The
//! liveness probe is a zero signal; stop delivers SIGTERM and leaves the
//! orderly teardown to the daemon itself.

use std::path::Path;

use crate::daemon::PidFile;
use crate::error::{Result, RolegateError};

pub fn status(pid_dir: &Path, system: &str) -> Result<()> {
    match PidFile::read(pid_dir, system) {
        None => {
            println!("{system}: not running");
            Ok(())
        }
        Some(pid) if process_alive(pid) => {
            println!("{system}: running (pid {pid})");
            Ok(())
        }
        Some(pid) => {
            println!("{system}: not running (stale pid file, pid {pid})");
            Ok(())
        }
    }
}

pub fn stop(pid_dir: &Path, system: &str) -> Result<()> {
    let pid = PidFile::read(pid_dir, system)
        .ok_or_else(|| RolegateError::NotRunning(system.to_string()))?;

    // SAFETY: kill with a valid signal number has no memory effects.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    println!("sent SIGTERM to {system} (pid {pid})");
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
