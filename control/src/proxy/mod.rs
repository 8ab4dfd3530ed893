//! Proxy process integration
//!
//! - manager: config files, secrets, reloads and the version handshake
//! - plus: incremental upstream API client
//! - renderer: models to config bytes
//! - fake: in-memory manager for tests

pub mod fake;
pub mod manager;
pub mod plus;
pub mod renderer;
