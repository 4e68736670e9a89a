//! # symphony-id
//!
//! Stable ID types for the Symphony orchestrator.
//!
//! Deployment ids are server-assigned and use a prefixed format:
//! `dep_{ulid}`, e.g. `dep_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix gives
//! type safety, the ULID gives time-ordered sortability and uniqueness.
//!
//! Node ids are not typed here: nodes choose their own opaque string id
//! and assert it in their hello message.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::DeploymentId;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
