//! SSH module - remote connections using russh
//!
//! - `client`: connect + authenticate, russh callback handler
//! - `handle_owner`: single task owning the russh `Handle`
//! - `session`: the connection type and the interactive shell pump

mod client;
mod config;
mod error;
mod handle_owner;
mod session;

pub use client::{ClientHandler, RusshConnector, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use session::SshConnection;
