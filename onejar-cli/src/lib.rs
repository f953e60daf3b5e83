//! onejar packager library
//!
//! - Content registry for deduplicating component files
//! - Input artifact access
//! - The packaging pipeline and executable assembly

pub mod artifact;
pub mod packager;
pub mod registry;

pub use packager::{PackageReport, Packager, PackagerOptions};
