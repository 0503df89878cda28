//! Single-instance guard for the dispatcher
//!
//! The lock is a marker file naming the PID of its holder. A marker whose
//! process is gone (crash, `kill -9`) is stale and gets reclaimed.

use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info, warn};

use crate::error::LockError;

#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    held: bool,
}

impl ProcessLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held
    }

    /// Try to become the single holder.
    ///
    /// Returns `Ok(false)` when a live process holds the lock. That is the
    /// expected outcome of overlapping invocations, not an error.
    ///
    /// # Errors
    /// Only when the marker cannot be created, read or removed at all.
    pub fn acquire(&mut self) -> Result<bool, LockError> {
        if self.held {
            return Ok(true);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.error(source))?;
        }

        // One attempt, plus one more after reclaiming a stale marker
        for _ in 0..2 {
            if self.create_marker()? {
                self.held = true;
                debug!(path = %self.path.display(), pid = std::process::id(), "Acquired process lock");
                return Ok(true);
            }

            let contents = match fs::read_to_string(&self.path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Unreadable lock marker, treating as stale");
                    String::new()
                }
            };

            if let Some(pid) = parse_pid(&contents)
                && is_process_alive(pid)
            {
                info!(path = %self.path.display(), pid, "Another dispatcher holds the lock");
                return Ok(false);
            }

            warn!(
                path = %self.path.display(),
                holder = contents.trim(),
                "Reclaiming stale lock marker"
            );

            if !self.remove_stale(&contents)? {
                return Ok(false);
            }
        }

        Ok(false)
    }

    /// Give the lock up. Safe to call any number of times.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }

        self.held = false;

        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock marker");
        } else {
            debug!(path = %self.path.display(), "Released process lock");
        }
    }

    /// Atomically create the marker with our PID already in it.
    ///
    /// The PID is written to a private file first and then hard-linked into
    /// place, so no other process can ever observe an empty marker.
    fn create_marker(&self) -> Result<bool, LockError> {
        let pid = std::process::id();
        let staging = self.sibling(&format!("{pid}.tmp"));

        fs::write(&staging, format!("{pid}\n")).map_err(|source| self.error(source))?;
        let linked = fs::hard_link(&staging, &self.path);
        let _ = fs::remove_file(&staging);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(self.error(source)),
        }
    }

    /// Move a stale marker out of the way.
    ///
    /// The marker is renamed rather than deleted and then re-checked, so a
    /// process that raced us and already replaced it keeps its lock.
    /// Returns `false` if that happened.
    fn remove_stale(&self, expected: &str) -> Result<bool, LockError> {
        let aside = self.sibling(&format!("{}.stale", std::process::id()));

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(source) => return Err(self.error(source)),
        }

        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved != expected {
            // Not the marker we judged stale; hand it back
            let restored = fs::hard_link(&aside, &self.path);
            let _ = fs::remove_file(&aside);
            if let Err(e) = restored
                && e.kind() != ErrorKind::AlreadyExists
            {
                return Err(self.error(e));
            }
            return Ok(false);
        }

        fs::remove_file(&aside).map_err(|source| self.error(source))?;
        Ok(true)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    fn error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Whether a process with this PID exists.
///
/// Asks the kernel first and falls back to the process table when the kernel
/// probe is unavailable or inconclusive.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    probe(pid).unwrap_or_else(|| process_table_lists(pid))
}

#[cfg(unix)]
fn probe(pid: u32) -> Option<bool> {
    let pid = libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)?;

    // SAFETY: signal 0 delivers nothing, it only checks existence and permission
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Some(true);
    }

    match io::Error::last_os_error().raw_os_error() {
        // Exists, but belongs to someone else
        Some(libc::EPERM) => Some(true),
        Some(libc::ESRCH) => Some(false),
        _ => None,
    }
}

#[cfg(not(unix))]
const fn probe(_pid: u32) -> Option<bool> {
    None
}

fn process_table_lists(pid: u32) -> bool {
    let pid_arg = pid.to_string();

    let output = if cfg!(windows) {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
    } else {
        Command::new("ps").args(["-p", &pid_arg]).output()
    };

    match output {
        Ok(output) if cfg!(windows) => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .any(|field| field == pid_arg),
        Ok(output) => output.status.success(),
        Err(e) => {
            // Without any way to check, assume the holder is alive rather
            // than risk two dispatchers
            warn!(pid, error = %e, "Cannot query the process table");
            true
        }
    }
}
