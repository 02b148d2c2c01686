//! The request loop on the control socket and the exec relay.

pub mod exec;
pub mod server;
pub mod wire;

pub use server::{Server, ServerError};
