//! drop-box: a line-protocol file upload service.
//!
//! The server multiplexes every client on a single dispatcher thread driven
//! by a readiness event loop. Each connection walks through a small protocol
//! state machine:
//! - greeting and login
//! - upload negotiation
//! - raw byte transfer of the announced size
//! - logout
//!
//! Configuration comes from CLI arguments or a TOML file.

pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod upload;

pub use config::{Config, ShutdownPolicy};
pub use runtime::{Server, ServerError, ServerHandle, SessionRegistry};
