pub mod auth;
pub mod comms;
pub mod config;
pub mod error;
pub mod security;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
