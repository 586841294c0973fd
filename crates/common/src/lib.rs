//! Harvester Common Library
//!
//! API types, identifiers and shared helpers for the Harvester Terraform provider.

pub mod api;
pub mod cloudinit;
pub mod constants;
pub mod error;
pub mod ids;
pub mod net;

// Re-export commonly used items
pub use error::{Error, Result};
pub use ids::{build_id, id_parts, id_parts3, namespaced_name, namespaced_name_parts};

/// Provider version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
