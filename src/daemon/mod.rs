//! Daemon lifecycle management
//!
//! PID-file bookkeeping, daemonization and privilege drop for the dispatch
//! server. The PID file location comes from the command line; the log file
//! sits next to it.

use crate::error::{Error, Result};
use nix::sys::signal;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub mod signals;

#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    log_file: PathBuf,
}

impl DaemonManager {
    pub fn new(pid_file: PathBuf) -> Self {
        let log_file = pid_file.with_extension("log");
        Self { pid_file, log_file }
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_file
    }

    pub fn log_path(&self) -> &Path {
        &self.log_file
    }

    /// Check whether the PID file names a live process.
    ///
    /// Stale or unreadable PID files are cleaned up along the way.
    pub fn is_running(&self) -> bool {
        if !self.pid_file.exists() {
            return false;
        }

        match fs::read_to_string(&self.pid_file) {
            Ok(pid_str) => match pid_str.trim().parse::<i32>() {
                Ok(pid) => {
                    // Signal 0 probes for existence without delivering.
                    if signal::kill(Pid::from_raw(pid), None).is_ok() {
                        true
                    } else {
                        warn!("stale PID file detected, cleaning up");
                        let _ = fs::remove_file(&self.pid_file);
                        false
                    }
                }
                Err(_) => {
                    warn!("invalid PID in file, removing");
                    let _ = fs::remove_file(&self.pid_file);
                    false
                }
            },
            Err(_) => {
                let _ = fs::remove_file(&self.pid_file);
                false
            }
        }
    }

    /// Fork into the background: write the PID file, detach from the
    /// terminal and redirect output to the log file. When started as root
    /// and `user` names someone else, the daemon assumes that identity.
    #[cfg(unix)]
    pub fn daemonize(&self, user: &str) -> Result<()> {
        use daemonize::Daemonize;
        use std::fs::OpenOptions;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|e| Error::Server(format!("failed to open log file: {}", e)))?;

        let mut daemon = Daemonize::new()
            .pid_file(&self.pid_file)
            .working_directory("/tmp")
            .stdout(log.try_clone().map_err(|e| {
                Error::Server(format!("failed to clone log file handle: {}", e))
            })?)
            .stderr(log);

        if nix::unistd::Uid::effective().is_root() && user != "root" {
            daemon = daemon.user(user);
        }

        daemon
            .start()
            .map_err(|e| Error::Server(format!("failed to daemonize: {}", e)))
    }

    #[cfg(not(unix))]
    pub fn daemonize(&self, _user: &str) -> Result<()> {
        Err(Error::Server(
            "daemon mode is not supported on this platform; use --foreground".into(),
        ))
    }

    /// Foreground mode: write the PID file in place and drop privileges
    /// when started as root.
    pub fn write_pid_and_drop_privileges(&self, user: &str) -> Result<()> {
        fs::write(&self.pid_file, format!("{}\n", std::process::id()))
            .map_err(|e| Error::Server(format!("failed to write PID file: {}", e)))?;

        #[cfg(unix)]
        if nix::unistd::Uid::effective().is_root() && user != "root" {
            let account = nix::unistd::User::from_name(user)
                .map_err(|e| Error::Server(format!("user lookup failed: {}", e)))?
                .ok_or_else(|| Error::Server(format!("unknown user {}", user)))?;
            nix::unistd::setgid(account.gid)
                .map_err(|e| Error::Server(format!("setgid failed: {}", e)))?;
            nix::unistd::setuid(account.uid)
                .map_err(|e| Error::Server(format!("setuid failed: {}", e)))?;
        }
        #[cfg(not(unix))]
        let _ = user;

        Ok(())
    }

    /// Remove the PID file on shutdown.
    pub fn remove_pid(&self) {
        let _ = fs::remove_file(&self.pid_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_file_sits_next_to_pid_file() {
        let mgr = DaemonManager::new(PathBuf::from("/tmp/zoneroute.pid"));
        assert_eq!(mgr.log_path(), Path::new("/tmp/zoneroute.log"));
    }

    #[test]
    fn is_running_without_pid_file() {
        let tmp = TempDir::new().unwrap();
        let mgr = DaemonManager::new(tmp.path().join("zoneroute.pid"));
        assert!(!mgr.is_running());
    }

    #[test]
    fn stale_pid_file_is_removed() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("zoneroute.pid");
        fs::write(&pid_file, "garbage").unwrap();
        let mgr = DaemonManager::new(pid_file.clone());
        assert!(!mgr.is_running());
        assert!(!pid_file.exists());
    }

    #[test]
    fn own_pid_counts_as_running() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("zoneroute.pid");
        fs::write(&pid_file, std::process::id().to_string()).unwrap();
        let mgr = DaemonManager::new(pid_file);
        assert!(mgr.is_running());
    }
}
