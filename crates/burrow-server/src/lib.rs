//! XRPC server for burrow.
//!
//! Hosts account repositories over HTTP: record writes and reads, repository
//! sync and export, blob upload and download, handle resolution, and the
//! `subscribeRepos` websocket firehose.

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod resolver;
pub mod router;
pub mod server;
pub mod state;

pub use auth::{Action, AuthProvider, Credentials, Identity, TokenAuth};
pub use config::{ServerConfig, TokenGrant};
pub use error::{ServerError, ServerResult};
pub use resolver::{CachingResolver, HandleResolver, LocalResolver};
pub use server::PdsServer;
pub use state::AppState;
