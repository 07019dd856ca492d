//! `inferlink-core` — shared building blocks.
//!
//! Identifiers, the domain error model and canonical content hashing. No IO.

pub mod error;
pub mod hash;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use hash::{ContentHash, HashError, compute_content_hash, compute_unique_key};
pub use id::{ExternalJobId, JobId, TenantId};
