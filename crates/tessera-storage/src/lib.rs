//! Storage abstraction for tessera.
//!
//! Backend crates (e.g., tessera-store-sqlite) implement the traits in
//! [`store`] so the hierarchy engine and the activity service don't depend
//! on any specific database engine or schema details.

use thiserror::Error;

mod store;
mod types;

pub use store::*;
pub use types::*;

/// Uniform error type for all storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}
