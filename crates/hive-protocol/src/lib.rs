//! Hive Protocol - Core types and message definitions
//!
//! Implements the Hive agent coordination message model: a typed
//! performative envelope with conversation correlation, relative expiry
//! and optional Ed25519 signatures.

pub mod constants;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
