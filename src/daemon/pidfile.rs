//! Single-instance enforcement via a PID file.
//!
//! One PID file exists per system name. Creation uses O_EXCL semantics so
//! that a second instance, or a crashed instance that left its file
//! behind, fails loudly instead of double-binding. The file holds the
//! decimal process id followed by a newline and is unlinked on drop, which
//! covers every shutdown path that unwinds.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, RolegateError};

/// Guard for the on-disk PID file. Dropping it removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn path_for(dir: &Path, system_name: &str) -> PathBuf {
        dir.join(format!("{system_name}.pid"))
    }

    /// Fail fast before any other resource is acquired when a previous
    /// instance left its file behind.
    pub fn check_absent(dir: &Path, system_name: &str) -> Result<()> {
        let path = Self::path_for(dir, system_name);
        if path.exists() {
            return Err(RolegateError::PidFileExists(path));
        }
        Ok(())
    }

    /// Create the PID file, refusing to clobber an existing one.
    pub fn create(dir: &Path, system_name: &str, pid: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, system_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    RolegateError::PidFileExists(path.clone())
                } else {
                    err.into()
                }
            })?;

        if let Err(err) = writeln!(file, "{pid}") {
            // do not leave a half-written file behind
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pid for a system, if any.
    pub fn read(dir: &Path, system_name: &str) -> Option<u32> {
        let path = Self::path_for(dir, system_name);
        let raw = fs::read_to_string(path).ok()?;
        raw.trim().parse().ok()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // ignore errors, there is nothing left to do about them here
        let _ = fs::remove_file(&self.path);
    }
}
