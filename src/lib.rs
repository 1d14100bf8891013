//! Zoneroute Library
//!
//! Core functionality for the geo-aware HTTP request dispatcher: the zone
//! index, node balancer and dispatch engine, plus the HTTP front-end.
//! This library can be embedded in other applications.

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod zone;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use proxy::DispatchServer;

/// Product token carried in the HTTP `Server` response header.
pub const SERVER_TOKEN: &str = "LPD/1.0";
