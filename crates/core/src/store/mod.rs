//! Revision store: commits, branches and tags for one proposal.
//!
//! Each proposal owns a bare git repository. Commits are git commits whose
//! tree holds exactly two blobs, `title` and `content`, so a commit id is a
//! content hash of the snapshot plus its ancestry. Branches and tags are git
//! refs and every ref change goes through [`RevisionStore::apply_ref_edits`],
//! which locks the refs, checks the expected old values and applies all
//! edits in one libgit2 transaction.

pub mod refs;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::{ErrorCode, Oid, Repository, Signature, Sort};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::StoreError;
use crate::models::{Author, DbId, Snapshot};
use crate::version::Version;

pub use refs::{BranchName, RefEdit, RefName, TagName};

const TITLE_ENTRY: &str = "title";
const CONTENT_ENTRY: &str = "content";
const BLOB_MODE: i32 = 0o100644;

/// Hard cap on history walks.
const MAX_HISTORY: usize = 1000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Hex object id of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }

    fn to_oid(&self) -> Result<Oid, StoreError> {
        Oid::from_str(&self.0).map_err(|_| StoreError::CommitNotFound(self.0.clone()))
    }
}

impl From<Oid> for CommitId {
    fn from(oid: Oid) -> Self {
        Self(oid.to_string())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable snapshot in a proposal's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub parent_ids: Vec<CommitId>,
    pub title: String,
    pub content: String,
    pub author: Author,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(&self.title, &self.content)
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle on one proposal's revision history.
///
/// The handle owns the underlying `git2::Repository`; dropping it closes the
/// repository. `Repository` is `Send` but not `Sync`, so a handle is opened
/// per operation rather than shared.
pub struct RevisionStore {
    repo: Repository,
    path: PathBuf,
}

impl RevisionStore {
    /// Create a new, empty store at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() && Repository::open_bare(path).is_ok() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }
        std::fs::create_dir_all(path)?;
        let repo = Repository::init_bare(path)?;
        info!("initialized revision store");
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening revision store");
        let repo = Repository::open_bare(path)
            .map_err(|_| StoreError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- commits ------------------------------------------------------------

    /// Write a new commit holding `snapshot` on top of `parents`.
    ///
    /// No ref moves; the caller advances a branch separately.
    #[instrument(skip_all, fields(parents = parents.len(), author = %author))]
    pub fn create_commit(
        &self,
        parents: &[CommitId],
        snapshot: &Snapshot,
        author: &Author,
        message: &str,
    ) -> Result<Commit, StoreError> {
        let title_blob = self.repo.blob(snapshot.title.as_bytes())?;
        let content_blob = self.repo.blob(snapshot.content.as_bytes())?;
        let mut builder = self.repo.treebuilder(None)?;
        builder.insert(TITLE_ENTRY, title_blob, BLOB_MODE)?;
        builder.insert(CONTENT_ENTRY, content_blob, BLOB_MODE)?;
        let tree = self.repo.find_tree(builder.write()?)?;

        let time = git2::Time::new(Utc::now().timestamp(), 0);
        let signature = Signature::new(&author.name, &author.email, &time)?;

        let parent_commits = parents
            .iter()
            .map(|id| self.find_git_commit(id))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self
            .repo
            .commit(None, &signature, &signature, message, &tree, &parent_refs)?;
        debug!(id = %oid, "created commit");
        self.find_commit(&CommitId::from(oid))
    }

    /// Load a commit and its snapshot.
    pub fn find_commit(&self, id: &CommitId) -> Result<Commit, StoreError> {
        let commit = self.find_git_commit(id)?;
        let snapshot = self.snapshot_of(&commit)?;
        let author = commit.author();
        let timestamp = Utc
            .timestamp_opt(author.when().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Commit {
            id: id.clone(),
            parent_ids: commit.parent_ids().map(CommitId::from).collect(),
            title: snapshot.title,
            content: snapshot.content,
            author: Author::new(
                author.name().unwrap_or_default(),
                author.email().unwrap_or_default(),
            ),
            message: commit.message().unwrap_or_default().to_string(),
            timestamp,
        })
    }

    /// Read just the `{title, content}` snapshot of a commit.
    pub fn read_snapshot(&self, id: &CommitId) -> Result<Snapshot, StoreError> {
        let commit = self.find_git_commit(id)?;
        self.snapshot_of(&commit)
    }

    fn find_git_commit(&self, id: &CommitId) -> Result<git2::Commit<'_>, StoreError> {
        self.repo
            .find_commit(id.to_oid()?)
            .map_err(|_| StoreError::CommitNotFound(id.to_string()))
    }

    fn snapshot_of(&self, commit: &git2::Commit<'_>) -> Result<Snapshot, StoreError> {
        let tree = commit.tree()?;
        let read_field = |name: &str| -> Result<String, StoreError> {
            let malformed = |detail: String| StoreError::MalformedSnapshot {
                commit: commit.id().to_string(),
                detail,
            };
            let entry = tree
                .get_name(name)
                .ok_or_else(|| malformed(format!("missing '{name}' entry")))?;
            let blob = self.repo.find_blob(entry.id())?;
            String::from_utf8(blob.content().to_vec())
                .map_err(|_| malformed(format!("'{name}' is not valid UTF-8")))
        };
        Ok(Snapshot {
            title: read_field(TITLE_ENTRY)?,
            content: read_field(CONTENT_ENTRY)?,
        })
    }

    // -- ancestry -----------------------------------------------------------

    /// Nearest common ancestor of two commits, if any.
    pub fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>, StoreError> {
        match self.repo.merge_base(a.to_oid()?, b.to_oid()?) {
            Ok(oid) => Ok(Some(oid.into())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(
        &self,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, StoreError> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self
            .repo
            .graph_descendant_of(descendant.to_oid()?, ancestor.to_oid()?)?)
    }

    /// Walk history backwards from `from`, newest first.
    pub fn history(&self, from: &CommitId, limit: usize) -> Result<Vec<Commit>, StoreError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(from.to_oid()?)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        let limit = limit.min(MAX_HISTORY);
        let mut commits = Vec::new();
        for oid in revwalk {
            if commits.len() >= limit {
                break;
            }
            commits.push(self.find_commit(&CommitId::from(oid?))?);
        }
        debug!(count = commits.len(), "collected history");
        Ok(commits)
    }

    // -- branches -----------------------------------------------------------

    /// Current head of `name`.
    pub fn resolve_branch(&self, name: &BranchName) -> Result<CommitId, StoreError> {
        self.try_resolve_branch(name)?
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))
    }

    /// Current head of `name`, or `None` if the branch does not exist.
    pub fn try_resolve_branch(&self, name: &BranchName) -> Result<Option<CommitId>, StoreError> {
        Ok(self.read_ref(&name.ref_name())?.map(CommitId::from))
    }

    /// Create `name` pointing at `target`; fails if it already exists.
    pub fn create_branch(&self, name: &BranchName, target: &CommitId) -> Result<(), StoreError> {
        self.apply_ref_edits(
            &[RefEdit::Create {
                name: name.clone().into(),
                target: target.clone(),
            }],
            &format!("branch: created {name}"),
        )
    }

    /// Compare-and-swap `name` from `expected` to `target`.
    pub fn advance_branch(
        &self,
        name: &BranchName,
        expected: &CommitId,
        target: &CommitId,
    ) -> Result<(), StoreError> {
        self.apply_ref_edits(
            &[RefEdit::Update {
                name: name.clone().into(),
                expected: expected.clone(),
                target: target.clone(),
            }],
            &format!("branch: advanced {name}"),
        )
    }

    /// All branches in this store with their heads.
    pub fn list_branches(&self) -> Result<Vec<(BranchName, CommitId)>, StoreError> {
        let mut branches = Vec::new();
        for reference in self.repo.references_glob("refs/heads/*")? {
            let reference = reference?;
            let (Some(full), Some(target)) = (reference.name(), reference.target()) else {
                continue;
            };
            match BranchName::from_ref_name(full) {
                Some(name) => branches.push((name, CommitId::from(target))),
                None => warn!(refname = full, "ignoring foreign ref"),
            }
        }
        branches.sort_by_key(|(name, _)| name.to_string());
        Ok(branches)
    }

    // -- tags ---------------------------------------------------------------

    /// Create an immutable tag.
    pub fn create_tag(&self, name: &TagName, target: &CommitId) -> Result<(), StoreError> {
        self.apply_ref_edits(
            &[RefEdit::Create {
                name: name.clone().into(),
                target: target.clone(),
            }],
            &format!("tag: created {name}"),
        )
    }

    pub fn resolve_tag(&self, name: &TagName) -> Result<CommitId, StoreError> {
        self.try_resolve_tag(name)?
            .ok_or_else(|| StoreError::TagNotFound(name.to_string()))
    }

    pub fn try_resolve_tag(&self, name: &TagName) -> Result<Option<CommitId>, StoreError> {
        Ok(self.read_ref(&name.ref_name())?.map(CommitId::from))
    }

    /// Remove a tag.
    pub fn delete_tag(&self, name: &TagName) -> Result<(), StoreError> {
        let current = self.resolve_tag(name)?;
        self.apply_ref_edits(
            &[RefEdit::Delete {
                name: name.clone().into(),
                expected: current,
            }],
            &format!("tag: deleted {name}"),
        )
    }

    /// Versions tagged for `proposal_id`, oldest first.
    pub fn list_tags(&self, proposal_id: DbId) -> Result<Vec<(Version, CommitId)>, StoreError> {
        let pattern = format!("{proposal_id}-*");
        let names = self.repo.tag_names(Some(&pattern))?;
        let mut tags = Vec::new();
        for name in names.iter().flatten() {
            let Ok(tag) = TagName::parse(name) else {
                continue;
            };
            if tag.proposal_id != proposal_id {
                continue;
            }
            if let Some(target) = self.try_resolve_tag(&tag)? {
                tags.push((tag.version, target));
            }
        }
        tags.sort_by_key(|(version, _)| *version);
        Ok(tags)
    }

    // -- atomic ref updates -------------------------------------------------

    /// Apply every edit or none of them.
    ///
    /// All refs are locked first, then each edit's expectation is checked
    /// against the current value. Any mismatch aborts the whole batch and
    /// releases the locks without touching a ref.
    #[instrument(skip_all, fields(count = edits.len(), message = message))]
    pub fn apply_ref_edits(&self, edits: &[RefEdit], message: &str) -> Result<(), StoreError> {
        let mut tx = self.repo.transaction()?;
        for edit in edits {
            tx.lock_ref(&edit.name().full_name())?;
        }

        for edit in edits {
            let name = edit.name();
            let current = self.read_ref(&name.full_name())?;
            match edit {
                RefEdit::Create { .. } => {
                    if current.is_some() {
                        return Err(StoreError::AlreadyExists(name.to_string()));
                    }
                }
                RefEdit::Update { expected, .. } | RefEdit::Delete { expected, .. } => {
                    let expected_oid = expected.to_oid()?;
                    if current != Some(expected_oid) {
                        warn!(%name, %expected, "ref moved since it was read");
                        return Err(StoreError::ConcurrentModification {
                            name: name.to_string(),
                            expected: expected.to_string(),
                            actual: current
                                .map(|oid| oid.to_string())
                                .unwrap_or_else(|| "<none>".into()),
                        });
                    }
                }
            }
        }

        for edit in edits {
            let full = edit.name().full_name();
            match edit {
                RefEdit::Create { target, .. } | RefEdit::Update { target, .. } => {
                    // Refuse dangling refs.
                    self.find_git_commit(target)?;
                    tx.set_target(&full, target.to_oid()?, None, message)?;
                }
                RefEdit::Delete { .. } => tx.remove(&full)?,
            }
        }

        tx.commit()?;
        debug!(message, "applied ref edits");
        Ok(())
    }

    fn read_ref(&self, full: &str) -> Result<Option<Oid>, StoreError> {
        match self.repo.find_reference(full) {
            Ok(reference) => Ok(reference.target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
