//! HTTP front-end: redirect emission and the admin API.

use crate::{config::Config, error::Result};

pub mod handler;
pub mod server;

pub use server::DispatchServer;

/// Initialize the dispatch server with configuration.
pub fn init(config: Config) -> Result<DispatchServer> {
    DispatchServer::new(config)
}
