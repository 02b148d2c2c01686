//! Container records and lifecycle management.

mod info;
pub mod manager;

pub use info::{parse_image_reference, ContainerInfo, ContainerStatus, Limits};
pub use manager::Manager;

use rand::RngCore;

/// Generates a 24-hex-char container id from the OS CSPRNG.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
