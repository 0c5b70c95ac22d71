//! Client for the science agent backend.
//!
//! [`connection`] keeps one WebSocket per agent session alive, correlating
//! commands with their responses and reconnecting with exponential backoff.
//! [`rest`] covers the HTTP endpoints for sessions, tasks and files.
//! [`store`] remembers sessions between runs, and [`cli`] drives all of it
//! from the `science-agent` binary.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod rest;
pub mod store;


pub use backoff::ReconnectPolicy;
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionState, FATAL_CONNECTION_LOST, PendingCommand,
    connect,
};
pub use error::{ApiError, CommandError};
pub use rest::ApiClient;
pub use store::SessionStore;
