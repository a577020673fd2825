//! Branch lifecycle for a proposal repository.
//!
//! The working line is born with a parentless commit when the proposal is
//! created. Contributor lines fork from the working head. `main` is never
//! touched here; it only moves through publish and revert.

use tracing::{debug, info, instrument};

use crate::errors::VersioningError;
use crate::models::{Author, DbId, Field, Snapshot};
use crate::store::{BranchName, Commit, CommitId, RevisionStore};

/// A contributor branch and where it points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributorFork {
    pub branch: BranchName,
    pub head: CommitId,
    /// False when the branch already existed.
    pub created: bool,
}

/// Creates, forks and commits to proposal branches.
pub struct BranchManager<'a> {
    store: &'a RevisionStore,
}

impl<'a> BranchManager<'a> {
    pub fn new(store: &'a RevisionStore) -> Self {
        Self { store }
    }

    /// Write the initial commit and point `proposal/<id>` at it.
    #[instrument(skip(self, snapshot, author))]
    pub fn create_working_branch(
        &self,
        proposal_id: DbId,
        snapshot: &Snapshot,
        author: &Author,
    ) -> Result<(BranchName, Commit), VersioningError> {
        let branch = BranchName::working(proposal_id);
        if self.store.try_resolve_branch(&branch)?.is_some() {
            return Err(VersioningError::InvalidOperation(format!(
                "working branch {branch} already exists"
            )));
        }
        let commit = self
            .store
            .create_commit(&[], snapshot, author, "Create proposal")?;
        self.store.create_branch(&branch, &commit.id)?;
        info!(%branch, head = %commit.id.short(), "created working branch");
        Ok((branch, commit))
    }

    /// Fork a contributor branch from the current working head.
    ///
    /// Forking a contributor that already has a branch returns the existing
    /// branch and head unchanged.
    #[instrument(skip(self))]
    pub fn fork_contributor_branch(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
    ) -> Result<ContributorFork, VersioningError> {
        let branch = BranchName::contributor(proposal_id, contributor_id);
        if let Some(head) = self.store.try_resolve_branch(&branch)? {
            debug!(%branch, "contributor branch already exists");
            return Ok(ContributorFork {
                branch,
                head,
                created: false,
            });
        }
        let working_head = self
            .store
            .resolve_branch(&BranchName::working(proposal_id))?;
        self.store.create_branch(&branch, &working_head)?;
        info!(%branch, head = %working_head.short(), "forked contributor branch");
        Ok(ContributorFork {
            branch,
            head: working_head,
            created: true,
        })
    }

    /// Change one field on `branch` and advance it with a new commit.
    ///
    /// The head is read once; if another writer moves the branch before the
    /// advance lands, the call fails with `ConcurrentModification`. An edit
    /// that would not change the field is refused.
    #[instrument(skip_all, fields(branch = %branch, field = %field))]
    pub fn commit_edit(
        &self,
        branch: &BranchName,
        field: Field,
        value: &str,
        author: &Author,
        message: &str,
    ) -> Result<Commit, VersioningError> {
        if *branch == BranchName::Main {
            return Err(VersioningError::InvalidOperation(
                "main only advances by publishing".into(),
            ));
        }
        let head = self.store.resolve_branch(branch)?;
        let current = self.store.read_snapshot(&head)?;
        if field.get(&current) == value {
            return Err(VersioningError::InvalidOperation(format!(
                "{field} on {branch} already has that value"
            )));
        }
        let next = field.set(&current, value);
        let message = if message.trim().is_empty() {
            format!("Update {field}")
        } else {
            message.to_string()
        };
        let commit = self
            .store
            .create_commit(&[head.clone()], &next, author, &message)?;
        self.store.advance_branch(branch, &head, &commit.id)?;
        debug!(head = %commit.id.short(), "committed edit");
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> Author {
        Author::new("Owner", "owner@example.org")
    }

    fn setup() -> (tempfile::TempDir, RevisionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RevisionStore::init(dir.path().join("9.git")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_working_branch_leaves_main_alone() {
        let (_dir, store) = setup();
        let manager = BranchManager::new(&store);
        let (branch, commit) = manager
            .create_working_branch(9, &Snapshot::new("Title", "Body"), &author())
            .unwrap();
        assert_eq!(branch.to_string(), "proposal/9");
        assert!(commit.parent_ids.is_empty());
        assert_eq!(store.resolve_branch(&branch).unwrap(), commit.id);
        assert!(store.try_resolve_branch(&BranchName::Main).unwrap().is_none());

        let again = manager.create_working_branch(9, &Snapshot::new("x", "y"), &author());
        assert!(matches!(again, Err(VersioningError::InvalidOperation(_))));
    }

    #[test]
    fn test_fork_is_idempotent() {
        let (_dir, store) = setup();
        let manager = BranchManager::new(&store);
        let (working, initial) = manager
            .create_working_branch(9, &Snapshot::new("Title", "Body"), &author())
            .unwrap();

        let fork = manager.fork_contributor_branch(9, 4).unwrap();
        assert_eq!(fork.branch.to_string(), "proposal/9/contributor/4");
        assert_eq!(fork.head, initial.id);
        assert!(fork.created);

        // Moving the working line does not move an existing fork.
        manager
            .commit_edit(&working, Field::Title, "Renamed", &author(), "rename")
            .unwrap();
        let again = manager.fork_contributor_branch(9, 4).unwrap();
        assert_eq!(again.head, initial.id);
        assert!(!again.created);
    }

    #[test]
    fn test_fork_without_working_branch() {
        let (_dir, store) = setup();
        let err = BranchManager::new(&store)
            .fork_contributor_branch(9, 1)
            .unwrap_err();
        assert!(matches!(err, VersioningError::NotFound { .. }));
    }

    #[test]
    fn test_commit_edit_changes_one_field() {
        let (_dir, store) = setup();
        let manager = BranchManager::new(&store);
        let (working, initial) = manager
            .create_working_branch(9, &Snapshot::new("Title", "Body"), &author())
            .unwrap();
        let commit = manager
            .commit_edit(&working, Field::Content, "New body", &author(), "")
            .unwrap();
        assert_eq!(commit.parent_ids, vec![initial.id]);
        assert_eq!(commit.snapshot(), Snapshot::new("Title", "New body"));
        assert_eq!(commit.message, "Update content");
        assert_eq!(store.resolve_branch(&working).unwrap(), commit.id);
    }

    #[test]
    fn test_commit_edit_refuses_unchanged_value() {
        let (_dir, store) = setup();
        let manager = BranchManager::new(&store);
        let (working, initial) = manager
            .create_working_branch(9, &Snapshot::new("Title", "Body"), &author())
            .unwrap();
        let err = manager
            .commit_edit(&working, Field::Title, "Title", &author(), "")
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));
        assert_eq!(store.resolve_branch(&working).unwrap(), initial.id);
    }

    #[test]
    fn test_commit_edit_refuses_main() {
        let (_dir, store) = setup();
        let err = BranchManager::new(&store)
            .commit_edit(&BranchName::Main, Field::Title, "x", &author(), "m")
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));
    }
}
