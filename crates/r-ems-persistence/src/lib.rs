//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Best-effort storage of node settings, lifecycle state, groups and tags.

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored record failed integrity verification.
    #[error("record hash mismatch in {0}")]
    HashMismatch(PathBuf),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),
    /// A tag was saved into a group that was never stored.
    #[error("group {group} of node {node} is not stored")]
    MissingGroup { node: String, group: String },
}

pub mod bridge;
pub mod file_store;
pub mod persister;

pub use bridge::{PersistenceBridge, PersistenceWriter, DEFAULT_QUEUE_DEPTH};
pub use file_store::{JsonFilePersister, STORE_VERSION};
pub use persister::{GroupRecord, NodeRecord, NoopPersister, PersistOp, Persister};
