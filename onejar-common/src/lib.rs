//! onejar Common Library
//!
//! Shared modules for both the packager and the bootstrap loader.
//! This crate has no runtime or CLI dependencies.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod payload;
pub mod plan;
pub mod properties;

pub use error::{OnejarError, OnejarResult};
pub use plan::{ComponentSpec, StartupPlan};
pub use properties::Properties;
