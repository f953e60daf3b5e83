//! onejar Runtime Library
//!
//! This library provides the bootstrap loader components:
//! - Module runtime contract
//! - Resource access over the packaged archive
//! - Two-stage isolated launch
//! - Temporary storage and signal cleanup
//! - The boot state machine and a local runtime

// Re-export from onejar-common for convenience
pub use onejar_common::{layout, payload, plan, properties};

pub mod boot;
pub mod isolation;
pub mod local;
pub mod resources;
pub mod runtime;
pub mod storage;
