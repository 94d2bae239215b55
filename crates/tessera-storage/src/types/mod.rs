//! Type definitions for tessera storage.

mod entities;
mod ids;
mod relations;

// Re-export all types from submodules
pub use entities::*;
pub use ids::*;
pub use relations::*;
