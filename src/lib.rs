#![cfg_attr(doc, doc = include_str!("../README.md"))]

#[cfg(feature = "client")]
pub mod client;
pub mod error;
pub(crate) mod serde_helpers;
#[cfg(feature = "server")]
pub mod server;
pub mod types;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Path of the socket endpoint on the application server
pub const SOCKET_PATH: &str = "/ws";

/// Path of the hub diagnostics endpoint
pub const STATUS_PATH: &str = "/api/ws/status";
