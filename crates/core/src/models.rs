//! Domain model types used throughout Draftline.
//!
//! These types bridge the versioning engine, the database layer, and the
//! external collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::version::Version;

/// Row id of any relational record.
pub type DbId = i64;

// ---------------------------------------------------------------------------
// Snapshot & author
// ---------------------------------------------------------------------------

/// The two versioned fields of a proposal at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: String,
    pub content: String,
}

impl Snapshot {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }

    /// Hex SHA-256 over title and content, used by collaborators to skip
    /// documents they have already processed.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One of the two independently versioned fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Content,
}

impl Field {
    pub const ALL: [Field; 2] = [Field::Title, Field::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Content => "content",
        }
    }

    /// Read this field out of a snapshot.
    pub fn get<'a>(&self, snapshot: &'a Snapshot) -> &'a str {
        match self {
            Self::Title => &snapshot.title,
            Self::Content => &snapshot.content,
        }
    }

    /// Return `snapshot` with this field replaced by `value`.
    pub fn set(&self, snapshot: &Snapshot, value: impl Into<String>) -> Snapshot {
        let mut next = snapshot.clone();
        match self {
            Self::Title => next.title = value.into(),
            Self::Content => next.content = value.into(),
        }
        next
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit author identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl std::fmt::Display for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Publication status of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Draft,
    Published,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Published => "PUBLISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "PUBLISHED" => Some(Self::Published),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a contributor was invited to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributorRole {
    Editor,
    Reviewer,
}

impl ContributorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editor => "EDITOR",
            Self::Reviewer => "REVIEWER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "EDITOR" => Some(Self::Editor),
            "REVIEWER" => Some(Self::Reviewer),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContributorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a contributor may currently commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributorStatus {
    Active,
    Suspended,
}

impl ContributorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "SUSPENDED" => Some(Self::Suspended),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContributorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a pull request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullRequestStatus {
    Open,
    Merged,
}

impl PullRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Merged => "MERGED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "MERGED" => Some(Self::Merged),
            _ => None,
        }
    }
}

impl std::fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Relational records
// ---------------------------------------------------------------------------

/// A registered platform user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: DbId,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// The identity recorded on commits made by this user.
    pub fn author(&self) -> Author {
        Author::new(&self.display_name, &self.email)
    }
}

/// The relational proposal record. `title` and `content` mirror the head of
/// `working_branch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: DbId,
    pub owner_id: DbId,
    pub title: String,
    pub content: String,
    pub version: Version,
    pub status: ProposalStatus,
    pub working_branch: String,
    pub last_commit_id: String,
    pub published_commit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(&self.title, &self.content)
    }

    pub fn is_owned_by(&self, user_id: DbId) -> bool {
        self.owner_id == user_id
    }
}

/// A user collaborating on one proposal through their own branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub id: DbId,
    pub proposal_id: DbId,
    pub user_id: DbId,
    pub role: ContributorRole,
    pub status: ContributorStatus,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// A request to merge a contributor branch into the working branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: DbId,
    pub proposal_id: DbId,
    pub contributor_id: DbId,
    pub source_branch: String,
    pub target_branch: String,
    pub description: String,
    pub status: PullRequestStatus,
    pub merge_commit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Kinds of versioning actions recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProposalCreated,
    ContributorAdded,
    ContributorStatusChanged,
    Edited,
    MergeRequested,
    MergeAccepted,
    ContributorSynced,
    Published,
    Reverted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProposalCreated => "proposal_created",
            Self::ContributorAdded => "contributor_added",
            Self::ContributorStatusChanged => "contributor_status_changed",
            Self::Edited => "edited",
            Self::MergeRequested => "merge_requested",
            Self::MergeAccepted => "merge_accepted",
            Self::ContributorSynced => "contributor_synced",
            Self::Published => "published",
            Self::Reverted => "reverted",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub proposal_id: Option<DbId>,
    pub actor_id: Option<DbId>,
    pub commit_id: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Collaborator payload
// ---------------------------------------------------------------------------

/// Proposal state handed to external collaborators after publish/revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSnapshot {
    pub proposal_id: DbId,
    pub title: String,
    pub content: String,
    pub version: String,
    pub status: ProposalStatus,
    pub commit_id: String,
    pub fingerprint: String,
}

impl From<&Proposal> for ProposalSnapshot {
    fn from(p: &Proposal) -> Self {
        Self {
            proposal_id: p.id,
            title: p.title.clone(),
            content: p.content.clone(),
            version: p.version.to_string(),
            status: p.status,
            commit_id: p.last_commit_id.clone(),
            fingerprint: p.snapshot().fingerprint(),
        }
    }
}
