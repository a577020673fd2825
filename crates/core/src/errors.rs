//! Error types for the Draftline core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`VersioningError`] is the taxonomy surfaced by the
//! proposal service.

use thiserror::Error;

use crate::merge::FieldConflict;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Versioning(#[from] VersioningError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

// ---------------------------------------------------------------------------
// Revision store errors
// ---------------------------------------------------------------------------

/// Errors from the git-backed revision store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The repository path does not exist or is not a git repo.
    #[error("revision store not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A branch could not be resolved.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// A tag could not be resolved.
    #[error("tag not found: {0}")]
    TagNotFound(String),

    /// A commit id does not name a commit in this store.
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// Tried to create a ref that already exists.
    #[error("ref already exists: {0}")]
    AlreadyExists(String),

    /// A ref moved between the caller's read and its update.
    #[error("concurrent modification of '{name}': expected {expected}, found {actual}")]
    ConcurrentModification {
        name: String,
        expected: String,
        actual: String,
    },

    /// A commit tree is missing one of the snapshot fields.
    #[error("commit {commit} has a malformed snapshot: {detail}")]
    MalformedSnapshot { commit: String, detail: String },

    /// A branch or tag name could not be parsed.
    #[error("invalid ref name '{0}'")]
    InvalidName(String),

    /// Generic I/O wrapper.
    #[error("revision store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Versioning errors
// ---------------------------------------------------------------------------

/// Errors surfaced by proposal versioning operations.
#[derive(Debug, Error)]
pub enum VersioningError {
    /// A proposal, contributor, user, branch, tag or pull request is missing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The caller is not allowed to perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Both sides of a merge changed the same field differently.
    #[error("merge conflict on {}", conflict_field_list(.fields))]
    MergeConflict { fields: Vec<FieldConflict> },

    /// A branch head changed under the writer. The caller must retry.
    #[error("branch '{branch}' was modified concurrently")]
    ConcurrentModification { branch: String },

    /// Another writer held the proposal's lock past the wait timeout.
    #[error("proposal {proposal_id} is locked by another writer")]
    Locked { proposal_id: i64 },

    /// The tag for the previous version is missing.
    #[error("revert target tag not found: {tag}")]
    RevertTargetNotFound { tag: String },

    /// Underlying revision store failure.
    #[error("revision store error: {0}")]
    Store(StoreError),

    /// Underlying database failure.
    #[error("versioning database error: {0}")]
    Database(DatabaseError),
}

impl VersioningError {
    /// Shorthand for [`VersioningError::NotFound`].
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Names of the conflicting fields, if this is a merge conflict.
    pub fn conflicting_fields(&self) -> Vec<&'static str> {
        match self {
            Self::MergeConflict { fields } => fields.iter().map(|c| c.field.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn conflict_field_list(fields: &[FieldConflict]) -> String {
    fields
        .iter()
        .map(|c| c.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<StoreError> for VersioningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BranchNotFound(name) => Self::not_found("branch", name),
            StoreError::TagNotFound(name) => Self::not_found("tag", name),
            StoreError::CommitNotFound(id) => Self::not_found("commit", id),
            StoreError::ConcurrentModification { name, .. } => {
                Self::ConcurrentModification { branch: name }
            }
            other => Self::Store(other),
        }
    }
}

impl From<DatabaseError> for VersioningError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            DatabaseError::StaleProposal { id } => Self::ConcurrentModification {
                branch: crate::store::BranchName::working(id).to_string(),
            },
            other => Self::Database(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The proposal row changed after the writer read it.
    #[error("proposal {id} was modified concurrently")]
    StaleProposal { id: i64 },

    /// A stored column held a value outside its enum.
    #[error("invalid value '{value}' in column {column}")]
    InvalidColumn { column: String, value: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the external collaborator notifications.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The search index rejected a request.
    #[error("search index notification failed: {0}")]
    SearchIndexError(String),

    /// The content-analysis service rejected a request.
    #[error("content analysis notification failed: {0}")]
    AnalysisError(String),

    /// HTTP error during notification delivery.
    #[error("notification HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Every retry attempt failed.
    #[error("{target} delivery gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Field;

    #[test]
    fn test_error_display_messages() {
        let err = StoreError::BranchNotFound("proposal/7".into());
        assert_eq!(err.to_string(), "branch not found: proposal/7");

        let err = VersioningError::RevertTargetNotFound {
            tag: "7-0.0.1".into(),
        };
        assert!(err.to_string().contains("7-0.0.1"));

        let err = ConfigError::EnvVarMissing {
            var: "ANALYSIS_TOKEN".into(),
            field: "notifications.analysis_token_env".into(),
        };
        assert!(err.to_string().contains("ANALYSIS_TOKEN"));
    }

    #[test]
    fn test_merge_conflict_lists_fields() {
        let err = VersioningError::MergeConflict {
            fields: vec![FieldConflict {
                field: Field::Content,
                base: "a".into(),
                ours: "b".into(),
                theirs: "c".into(),
            }],
        };
        assert_eq!(err.to_string(), "merge conflict on content");
        assert_eq!(err.conflicting_fields(), vec!["content"]);
    }

    #[test]
    fn test_store_error_maps_to_taxonomy() {
        let err: VersioningError = StoreError::ConcurrentModification {
            name: "proposal/1".into(),
            expected: "aaa".into(),
            actual: "bbb".into(),
        }
        .into();
        assert!(matches!(
            err,
            VersioningError::ConcurrentModification { ref branch } if branch == "proposal/1"
        ));

        let err: VersioningError = StoreError::TagNotFound("1-0.0.2".into()).into();
        assert!(matches!(err, VersioningError::NotFound { .. }));

        let err: VersioningError = StoreError::InvalidName("x".into()).into();
        assert!(matches!(err, VersioningError::Store(_)));

        let err: VersioningError = DatabaseError::NotFound {
            entity: "contributor".into(),
            id: "9".into(),
        }
        .into();
        assert_eq!(err.to_string(), "contributor not found: 9");
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let db_err = DatabaseError::NotFound {
            entity: "proposal".into(),
            id: "3".into(),
        };
        let core_err: CoreError = db_err.into();
        assert!(matches!(core_err, CoreError::Database(_)));
    }
}
