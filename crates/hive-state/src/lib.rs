//! Hive agent state
//!
//! State owned by a single endpoint or coordinator instance:
//! - `TrustTable`: locally observed per-peer trust scores
//! - `AgentRegistry`: capability and workload snapshot used for task assignment

pub mod registry;
pub mod trust;

pub use registry::{AgentDirectory, AgentProfile, AgentRegistry};
pub use trust::{TrustEvent, TrustRecord, TrustTable};
