//! Kiln Core - Foundational Types
//!
//! Errors, configuration, ID mapping requests and namespace settings shared
//! by the kiln crates.

pub mod config;
pub mod error;
pub mod idmap;
pub mod namespace;

// Re-export commonly used types
pub use config::{KilnConfig, Platform, PullConfig, PullPolicy, StoreConfig, SystemContext};
pub use error::{CandidateFailure, KilnError, ResolutionError, Result, ResultExt};
pub use idmap::{IdMap, IdMappingOptions};
pub use namespace::{default_namespace_options, NamespaceOption, NamespaceOptions};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
