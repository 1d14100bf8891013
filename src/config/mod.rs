//! Runtime configuration
//!
//! Process-level settings (listen address, config directory, pid file,
//! privilege drop, worker sizing) come from the command line; the dispatch
//! model itself is read from the config directory by [`loader`].

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub mod loader;

pub use loader::load_dispatcher;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `ipz` and the per-vhost subdirectories.
    pub config_dir: PathBuf,
    /// Listen address; a bare `:port` binds all interfaces.
    pub listen: String,
    pub pid_file: PathBuf,
    /// Identity to assume when started as root.
    pub user: String,
    /// Tokio worker threads; 0 keeps the runtime default.
    pub worker_threads: usize,
    /// Skip daemonization and log to the terminal.
    pub foreground: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::new(),
            listen: ":8080".to_string(),
            pid_file: PathBuf::from("/tmp/zoneroute.pid"),
            user: "root".to_string(),
            worker_threads: 0,
            foreground: false,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let listen = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        listen.parse().map_err(|e| {
            Error::Config(format!("invalid listen address {:?}: {}", self.listen, e))
        })
    }
}
