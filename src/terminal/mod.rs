//! Remote terminal proxy
//!
//! Authenticates a browser transport, opens a remote shell and bridges it.

pub mod events;
pub mod proxy;

pub use events::{AuthResult, ClientEvent, ErrorPayload, ResizeRequest, ServerEvent, Utf8Decoder};
pub use proxy::{ShellTarget, TerminalProxy};
