//! Central-role session management.
//!
//! Components, leaves first: the UUID codec, the advertisement scanner, the
//! paired-device watcher, the per-connection GATT cache, device sessions, the
//! connection registry and finally the session manager that dispatches
//! commands across all of them.

pub mod address;
pub mod gatt_cache;
pub mod manager;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod uuid;
pub mod watcher;
