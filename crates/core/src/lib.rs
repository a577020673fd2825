//! Draftline core library.
//!
//! This crate versions collaborative proposals: a git-backed revision store
//! per proposal, contributor branches with field-level merges, semantic
//! versioned publishing and reverting, a SQLite record of users, proposals
//! and pull requests, and notifications to external collaborators.

pub mod branch;
pub mod config;
pub mod db;
pub mod errors;
pub mod lock;
pub mod merge;
pub mod models;
pub mod notify;
pub mod release;
pub mod service;
pub mod store;
pub mod version;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use errors::{CoreError, VersioningError};
pub use merge::{MergeKind, MergeOutcome};
pub use models::{Field, Proposal, ProposalStatus, Snapshot};
pub use notify::Notifier;
pub use release::{PublishOutcome, RevertOutcome};
pub use service::ProposalService;
pub use store::{BranchName, CommitId, RevisionStore};
pub use version::Version;
