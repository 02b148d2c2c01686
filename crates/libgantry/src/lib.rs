//! Container lifecycle engine for the gantry runtime.
//!
//! The daemon binary drives this library two ways: in server mode it
//! runs [`daemon::Server`] on the control socket, and when re-executed
//! with the hidden init argument it runs [`process::init`] as PID 1 of
//! the new namespaces.

pub mod cgroups;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod image;
pub mod network;
pub mod process;
pub mod rootfs;
pub mod store;

pub use error::GantryError;
