pub mod config;
pub mod device;
pub mod encoder;
pub mod install;
pub mod wire;

pub use config::{AgentConfig, StorageLimits};
pub use device::DeviceFacts;

/// Version string reported in upload headers.
pub const LIBRARY_VERSION: &str = concat!("rust_", env!("CARGO_PKG_VERSION"));

/// Current unix time in whole seconds, as sent on the wire.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
