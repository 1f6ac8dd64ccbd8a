//! Browser transport bridge

pub mod server;

pub use server::{parse_client_event, serve};
