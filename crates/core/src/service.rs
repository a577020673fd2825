//! Proposal orchestration.
//!
//! [`ProposalService`] validates callers and state against the relational
//! record, delegates the version-control effect to the branch manager, merge
//! engine or version controller, writes the result back in one database
//! transaction and finally notifies collaborators.
//!
//! Ref moves happen before the database write. If the write fails, the
//! applied ref edits are undone with their inverse edits so the two stores
//! never disagree.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::branch::BranchManager;
use crate::config::AppConfig;
use crate::db::{queries, Database};
use crate::errors::{CoreError, VersioningError};
use crate::lock::{LockTable, ProposalGuard};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::models::{
    AuditAction, AuditEntry, Contributor, ContributorRole, ContributorStatus, DbId, Field,
    Proposal, ProposalSnapshot, ProposalStatus, PullRequest, PullRequestStatus, Snapshot, User,
};
use crate::notify::Notifier;
use crate::release::{PublishOutcome, RevertOutcome, VersionController};
use crate::store::{BranchName, Commit, CommitId, RefEdit, RevisionStore};
use crate::version::Version;

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Writer lock file inside each proposal repository.
const LOCK_FILE: &str = "draftline.lock";

/// Facade over the versioning engine and the relational record.
pub struct ProposalService {
    db: Arc<Database>,
    repos_dir: PathBuf,
    notifier: Notifier,
    locks: LockTable,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ProposalService {
    pub fn new(db: Arc<Database>, repos_dir: impl Into<PathBuf>, notifier: Notifier) -> Self {
        Self {
            db,
            repos_dir: repos_dir.into(),
            notifier,
            locks: LockTable::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Open the database and repository directory named by `config`,
    /// creating them if needed.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let storage = &config.storage;
        std::fs::create_dir_all(storage.repos_dir())
            .map_err(crate::errors::DatabaseError::IoError)?;
        let db = Database::new(storage.database_path())?;
        db.initialize()?;
        let notifier = Notifier::new(&config.notifications)?;
        Ok(Self::new(Arc::new(db), storage.repos_dir(), notifier))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn repo_path(&self, proposal_id: DbId) -> PathBuf {
        self.repos_dir.join(format!("{proposal_id}.git"))
    }

    /// Wait for every notification spawned so far.
    pub async fn flush_notifications(&self) {
        let handles: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "notification task failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    #[instrument(skip(self, display_name, email))]
    pub fn register_user(
        &self,
        username: &str,
        display_name: &str,
        email: &str,
    ) -> Result<User, VersioningError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(VersioningError::InvalidOperation(
                "username must not be empty".into(),
            ));
        }
        if !email.contains('@') {
            return Err(VersioningError::InvalidOperation(format!(
                "'{email}' is not an email address"
            )));
        }
        let display_name = if display_name.trim().is_empty() {
            username
        } else {
            display_name.trim()
        };
        let user = self.db.try_transaction(|conn| {
            if queries::find_user_by_username(conn, username)?.is_some() {
                return Err(VersioningError::InvalidOperation(format!(
                    "username '{username}' is taken"
                )));
            }
            Ok(queries::insert_user(conn, username, display_name, email)?)
        })?;
        info!(user_id = user.id, "registered user");
        Ok(user)
    }

    pub fn get_user(&self, id: DbId) -> Result<User, VersioningError> {
        Ok(self.db.get_user(id)?)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>, VersioningError> {
        Ok(self.db.find_user_by_username(username)?)
    }

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------

    /// Create a draft proposal at 0.0.0 with its working branch.
    #[instrument(skip(self, title, content))]
    pub async fn create_proposal(
        &self,
        owner_id: DbId,
        title: &str,
        content: &str,
    ) -> Result<Proposal, VersioningError> {
        let owner = self.db.get_user(owner_id)?;
        if title.trim().is_empty() {
            return Err(VersioningError::InvalidOperation(
                "title must not be empty".into(),
            ));
        }

        let mut created_repo: Option<PathBuf> = None;
        let result = self.db.try_transaction(|conn| {
            let id = queries::insert_proposal(conn, owner.id, title, content)?;
            let path = self.repo_path(id);
            let store = RevisionStore::init(&path)?;
            created_repo = Some(path);

            let (branch, commit) = BranchManager::new(&store).create_working_branch(
                id,
                &Snapshot::new(title, content),
                &owner.author(),
            )?;
            let mut proposal = queries::get_proposal(conn, id)?;
            proposal.working_branch = branch.to_string();
            proposal.last_commit_id = commit.id.to_string();
            queries::update_proposal(conn, &proposal)?;
            queries::insert_audit(
                conn,
                AuditAction::ProposalCreated,
                Some(id),
                Some(owner.id),
                Some(commit.id.as_str()),
                Some(&proposal.title),
            )?;
            Ok::<_, VersioningError>(proposal)
        });

        match result {
            Ok(proposal) => {
                info!(proposal_id = proposal.id, "created proposal");
                Ok(proposal)
            }
            Err(e) => {
                if let Some(path) = created_repo {
                    remove_repo(&path);
                }
                Err(e)
            }
        }
    }

    pub fn get_proposal(&self, id: DbId) -> Result<Proposal, VersioningError> {
        Ok(self.db.get_proposal(id)?)
    }

    pub fn list_proposals(&self) -> Result<Vec<Proposal>, VersioningError> {
        Ok(self.db.list_proposals()?)
    }

    /// Change a field directly on the working branch. Owner only.
    #[instrument(skip_all, fields(proposal_id = proposal_id, caller = caller, field = %field))]
    pub async fn edit_working(
        &self,
        proposal_id: DbId,
        caller: DbId,
        field: Field,
        value: &str,
        message: &str,
    ) -> Result<Commit, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        let owner = self.require_owner(&proposal, caller)?;
        let store = self.open_store(proposal_id)?;

        let branch = BranchName::working(proposal_id);
        let commit = BranchManager::new(&store).commit_edit(
            &branch,
            field,
            value,
            &owner.author(),
            message,
        )?;
        let edits = advance_edit(&branch, &commit);

        self.persist(&store, &edits, |conn| {
            let mut updated = proposal.clone();
            sync_cache(&mut updated, &commit.snapshot(), &commit.id);
            queries::update_proposal_checked(conn, &proposal, &updated)?;
            queries::insert_audit(
                conn,
                AuditAction::Edited,
                Some(proposal_id),
                Some(caller),
                Some(commit.id.as_str()),
                Some(&format!("{field} on {branch}")),
            )?;
            Ok(())
        })?;
        Ok(commit)
    }

    // -----------------------------------------------------------------------
    // Contributors
    // -----------------------------------------------------------------------

    /// Register `user_id` as a contributor and fork their branch.
    #[instrument(skip(self))]
    pub async fn add_contributor(
        &self,
        proposal_id: DbId,
        caller: DbId,
        user_id: DbId,
        role: ContributorRole,
    ) -> Result<Contributor, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        self.require_owner(&proposal, caller)?;
        let user = self.db.get_user(user_id)?;
        let store = self.open_store(proposal_id)?;

        let mut applied: Vec<RefEdit> = Vec::new();
        let result = self.db.try_transaction(|conn| {
            if queries::find_contributor(conn, proposal_id, user.id)?.is_some() {
                return Err(VersioningError::InvalidOperation(format!(
                    "{} already contributes to proposal {proposal_id}",
                    user.username
                )));
            }
            let id = queries::insert_contributor(conn, proposal_id, user.id, role)?;
            let fork = BranchManager::new(&store).fork_contributor_branch(proposal_id, id)?;
            if fork.created {
                applied.push(RefEdit::Create {
                    name: fork.branch.clone().into(),
                    target: fork.head.clone(),
                });
            }
            queries::set_contributor_branch(conn, id, &fork.branch.to_string())?;
            queries::insert_audit(
                conn,
                AuditAction::ContributorAdded,
                Some(proposal_id),
                Some(caller),
                Some(fork.head.as_str()),
                Some(&format!("{} as {role}", user.username)),
            )?;
            Ok(queries::get_contributor(conn, id)?)
        });

        if result.is_err() {
            self.compensate(&store, &applied);
        }
        let contributor = result?;
        info!(contributor_id = contributor.id, branch = %contributor.branch, "added contributor");
        Ok(contributor)
    }

    pub async fn suspend_contributor(
        &self,
        proposal_id: DbId,
        caller: DbId,
        contributor_id: DbId,
    ) -> Result<Contributor, VersioningError> {
        self.set_contributor_status(proposal_id, caller, contributor_id, ContributorStatus::Suspended)
            .await
    }

    pub async fn reactivate_contributor(
        &self,
        proposal_id: DbId,
        caller: DbId,
        contributor_id: DbId,
    ) -> Result<Contributor, VersioningError> {
        self.set_contributor_status(proposal_id, caller, contributor_id, ContributorStatus::Active)
            .await
    }

    #[instrument(skip(self))]
    async fn set_contributor_status(
        &self,
        proposal_id: DbId,
        caller: DbId,
        contributor_id: DbId,
        status: ContributorStatus,
    ) -> Result<Contributor, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        self.require_owner(&proposal, caller)?;
        let contributor = self.contributor_of(proposal_id, contributor_id)?;
        if contributor.status == status {
            return Ok(contributor);
        }
        let updated = self.db.try_transaction(|conn| {
            queries::set_contributor_status(conn, contributor_id, status)?;
            queries::insert_audit(
                conn,
                AuditAction::ContributorStatusChanged,
                Some(proposal_id),
                Some(caller),
                None,
                Some(&format!("contributor {contributor_id} -> {status}")),
            )?;
            Ok::<_, VersioningError>(queries::get_contributor(conn, contributor_id)?)
        })?;
        info!(contributor_id, %status, "contributor status changed");
        Ok(updated)
    }

    pub fn list_contributors(&self, proposal_id: DbId) -> Result<Vec<Contributor>, VersioningError> {
        self.db.get_proposal(proposal_id)?;
        Ok(self.db.list_contributors(proposal_id)?)
    }

    /// Commit a title change on the contributor's branch.
    pub async fn edit_title(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
        new_title: &str,
        message: &str,
    ) -> Result<Commit, VersioningError> {
        self.edit(proposal_id, contributor_id, caller, Field::Title, new_title, message)
            .await
    }

    /// Commit a content change on the contributor's branch.
    pub async fn edit_content(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
        new_content: &str,
        message: &str,
    ) -> Result<Commit, VersioningError> {
        self.edit(proposal_id, contributor_id, caller, Field::Content, new_content, message)
            .await
    }

    #[instrument(
        skip_all,
        fields(proposal_id = proposal_id, contributor_id = contributor_id, caller = caller, field = %field)
    )]
    async fn edit(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
        field: Field,
        value: &str,
        message: &str,
    ) -> Result<Commit, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let (contributor, user) = self.require_contributor_caller(proposal_id, contributor_id, caller)?;
        if contributor.status != ContributorStatus::Active {
            return Err(VersioningError::InvalidOperation(format!(
                "contributor {contributor_id} is suspended"
            )));
        }
        let store = self.open_store(proposal_id)?;
        let branch = BranchName::parse(&contributor.branch)?;

        let commit =
            BranchManager::new(&store).commit_edit(&branch, field, value, &user.author(), message)?;
        let edits = advance_edit(&branch, &commit);

        self.persist(&store, &edits, |conn| {
            queries::insert_audit(
                conn,
                AuditAction::Edited,
                Some(proposal_id),
                Some(caller),
                Some(commit.id.as_str()),
                Some(&format!("{field} on {branch}")),
            )?;
            Ok(())
        })?;
        Ok(commit)
    }

    /// Merge the working line into a contributor branch so the contributor
    /// picks up accepted work. Allowed for the contributor and the owner.
    #[instrument(skip(self))]
    pub async fn sync_contributor(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
    ) -> Result<MergeOutcome, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        let contributor = self.contributor_of(proposal_id, contributor_id)?;
        if contributor.user_id != caller && !proposal.is_owned_by(caller) {
            return Err(VersioningError::Unauthorized(format!(
                "user {caller} cannot sync contributor {contributor_id}"
            )));
        }
        let author = self.db.get_user(caller)?.author();
        let store = self.open_store(proposal_id)?;
        let target = BranchName::parse(&contributor.branch)?;

        let outcome = MergeEngine::new(&store).merge(
            &BranchName::working(proposal_id),
            &target,
            &author,
            None,
        )?;
        let edits: Vec<RefEdit> = outcome.applied.iter().cloned().collect();

        self.persist(&store, &edits, |conn| {
            queries::insert_audit(
                conn,
                AuditAction::ContributorSynced,
                Some(proposal_id),
                Some(caller),
                Some(outcome.head.as_str()),
                Some(&format!("{target} ({})", outcome.kind)),
            )?;
            Ok(())
        })?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Pull requests
    // -----------------------------------------------------------------------

    /// Open a pull request from the contributor branch to the working line.
    #[instrument(skip(self, description))]
    pub async fn request_merge(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
        description: &str,
    ) -> Result<PullRequest, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let (contributor, _) =
            self.require_contributor_caller(proposal_id, contributor_id, caller)?;
        let target = BranchName::working(proposal_id).to_string();

        let pr = self.db.try_transaction(|conn| {
            let id = queries::insert_pull_request(
                conn,
                proposal_id,
                contributor_id,
                &contributor.branch,
                &target,
                description,
            )?;
            queries::insert_audit(
                conn,
                AuditAction::MergeRequested,
                Some(proposal_id),
                Some(caller),
                None,
                Some(&format!("pull request {id}")),
            )?;
            Ok::<_, VersioningError>(queries::get_pull_request(conn, id)?)
        })?;
        info!(pull_request_id = pr.id, "merge requested");
        Ok(pr)
    }

    /// Merge an open pull request into the working line. Owner only.
    ///
    /// A field conflict leaves the working branch and the pull request
    /// untouched and surfaces as [`VersioningError::MergeConflict`].
    #[instrument(skip(self, message))]
    pub async fn accept_merge(
        &self,
        proposal_id: DbId,
        caller: DbId,
        pull_request_id: DbId,
        message: Option<&str>,
    ) -> Result<MergeOutcome, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        let owner = self.require_owner(&proposal, caller)?;
        let pr = self.db.get_pull_request(pull_request_id)?;
        if pr.proposal_id != proposal_id {
            return Err(VersioningError::not_found("pull request", pull_request_id));
        }
        if pr.status != PullRequestStatus::Open {
            return Err(VersioningError::InvalidOperation(format!(
                "pull request {pull_request_id} is {}",
                pr.status
            )));
        }

        let store = self.open_store(proposal_id)?;
        let source = BranchName::parse(&pr.source_branch)?;
        let target = BranchName::parse(&pr.target_branch)?;
        let message = message.filter(|m| !m.trim().is_empty());
        let outcome = MergeEngine::new(&store)
            .merge(&source, &target, &owner.author(), message)
            .map_err(|e| {
                if let VersioningError::MergeConflict { .. } = e {
                    warn!(pull_request_id, fields = ?e.conflicting_fields(), "pull request conflicts");
                }
                e
            })?;
        let edits: Vec<RefEdit> = outcome.applied.iter().cloned().collect();
        let snapshot = store.read_snapshot(&outcome.head)?;

        self.persist(&store, &edits, |conn| {
            queries::mark_pull_request_merged(conn, pull_request_id, outcome.head.as_str())?;
            let mut updated = proposal.clone();
            sync_cache(&mut updated, &snapshot, &outcome.head);
            queries::update_proposal_checked(conn, &proposal, &updated)?;
            queries::insert_audit(
                conn,
                AuditAction::MergeAccepted,
                Some(proposal_id),
                Some(caller),
                Some(outcome.head.as_str()),
                Some(&format!("pull request {pull_request_id} ({})", outcome.kind)),
            )?;
            Ok(())
        })?;
        info!(pull_request_id, kind = %outcome.kind, "pull request merged");
        Ok(outcome)
    }

    pub fn get_pull_request(&self, id: DbId) -> Result<PullRequest, VersioningError> {
        Ok(self.db.get_pull_request(id)?)
    }

    pub fn list_pull_requests(
        &self,
        proposal_id: DbId,
        status: Option<PullRequestStatus>,
    ) -> Result<Vec<PullRequest>, VersioningError> {
        self.db.get_proposal(proposal_id)?;
        Ok(self.db.list_pull_requests(proposal_id, status)?)
    }

    // -----------------------------------------------------------------------
    // Publish & revert
    // -----------------------------------------------------------------------

    /// Publish the working line as the next patch version. Owner only.
    #[instrument(skip(self))]
    pub async fn publish(
        &self,
        proposal_id: DbId,
        caller: DbId,
    ) -> Result<PublishOutcome, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        let owner = self.require_owner(&proposal, caller)?;
        let store = self.open_store(proposal_id)?;

        let outcome = VersionController::new(&store).publish(&proposal, &owner.author())?;
        let snapshot = store.read_snapshot(&outcome.commit_id)?;

        let updated = self.persist(&store, &outcome.edits, |conn| {
            let mut updated = proposal.clone();
            sync_cache(&mut updated, &snapshot, &outcome.commit_id);
            updated.version = outcome.version;
            updated.status = ProposalStatus::Published;
            updated.published_commit_id = Some(outcome.commit_id.to_string());
            queries::update_proposal_checked(conn, &proposal, &updated)?;
            queries::insert_audit(
                conn,
                AuditAction::Published,
                Some(proposal_id),
                Some(caller),
                Some(outcome.commit_id.as_str()),
                Some(&outcome.tag),
            )?;
            Ok(updated)
        })?;

        info!(proposal_id, version = %outcome.version, tag = %outcome.tag, "proposal published");
        let handles = self
            .notifier
            .on_published(ProposalSnapshot::from(&updated), caller);
        self.track(handles);
        Ok(outcome)
    }

    /// Step back one published version. Owner only.
    #[instrument(skip(self))]
    pub async fn revert(
        &self,
        proposal_id: DbId,
        caller: DbId,
    ) -> Result<RevertOutcome, VersioningError> {
        let _guard = self.lock(proposal_id).await?;
        let proposal = self.db.get_proposal(proposal_id)?;
        self.require_owner(&proposal, caller)?;
        let store = self.open_store(proposal_id)?;

        let outcome = VersionController::new(&store).revert(&proposal)?;
        let from = proposal.version;

        let updated = self.persist(&store, outcome.edits(), |conn| {
            let mut updated = proposal.clone();
            let details = match &outcome {
                RevertOutcome::Restored {
                    version,
                    commit_id,
                    snapshot,
                    ..
                } => {
                    sync_cache(&mut updated, snapshot, commit_id);
                    updated.version = *version;
                    updated.status = ProposalStatus::Published;
                    updated.published_commit_id = Some(commit_id.to_string());
                    format!("{from} -> {version}")
                }
                RevertOutcome::BackToDraft { abandoned_tag, .. } => {
                    updated.version = Version::INITIAL;
                    updated.status = ProposalStatus::Draft;
                    updated.published_commit_id = None;
                    match abandoned_tag {
                        Some(tag) => format!("withdrew {tag}, back to draft"),
                        None => "back to draft".to_string(),
                    }
                }
            };
            queries::update_proposal_checked(conn, &proposal, &updated)?;
            queries::insert_audit(
                conn,
                AuditAction::Reverted,
                Some(proposal_id),
                Some(caller),
                Some(&updated.last_commit_id),
                Some(&details),
            )?;
            Ok(updated)
        })?;

        info!(
            proposal_id,
            version = %updated.version,
            status = %updated.status,
            "proposal reverted"
        );
        let back_to_draft = matches!(outcome, RevertOutcome::BackToDraft { .. });
        let handles =
            self.notifier
                .on_reverted(ProposalSnapshot::from(&updated), back_to_draft, caller);
        self.track(handles);
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Read queries (no lock)
    // -----------------------------------------------------------------------

    /// Commits reachable from `branch`, newest first.
    pub fn history(
        &self,
        proposal_id: DbId,
        branch: &BranchName,
        limit: usize,
    ) -> Result<Vec<Commit>, VersioningError> {
        if branch.proposal_id().is_some_and(|id| id != proposal_id) {
            return Err(VersioningError::InvalidOperation(format!(
                "{branch} does not belong to proposal {proposal_id}"
            )));
        }
        let store = self.open_store(proposal_id)?;
        let head = store.resolve_branch(branch)?;
        Ok(store.history(&head, limit)?)
    }

    /// Published versions still tagged, oldest first.
    pub fn list_versions(
        &self,
        proposal_id: DbId,
    ) -> Result<Vec<(Version, CommitId)>, VersioningError> {
        let store = self.open_store(proposal_id)?;
        Ok(store.list_tags(proposal_id)?)
    }

    pub fn list_branches(
        &self,
        proposal_id: DbId,
    ) -> Result<Vec<(BranchName, CommitId)>, VersioningError> {
        let store = self.open_store(proposal_id)?;
        Ok(store.list_branches()?)
    }

    pub fn read_snapshot(
        &self,
        proposal_id: DbId,
        commit_id: &CommitId,
    ) -> Result<Snapshot, VersioningError> {
        let store = self.open_store(proposal_id)?;
        Ok(store.read_snapshot(commit_id)?)
    }

    /// Snapshot at the head of the working branch.
    pub fn working_snapshot(&self, proposal_id: DbId) -> Result<Snapshot, VersioningError> {
        let store = self.open_store(proposal_id)?;
        let head = store.resolve_branch(&BranchName::working(proposal_id))?;
        Ok(store.read_snapshot(&head)?)
    }

    pub fn audit_log(
        &self,
        proposal_id: Option<DbId>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, VersioningError> {
        Ok(self.db.list_audit(proposal_id, limit)?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Serialize mutating operations on one proposal, across processes
    /// sharing the data directory as well as within this one.
    async fn lock(&self, proposal_id: DbId) -> Result<ProposalGuard, VersioningError> {
        let repo = self.repo_path(proposal_id);
        if !repo.is_dir() {
            return Err(VersioningError::not_found("proposal", proposal_id));
        }
        self.locks
            .acquire(proposal_id, &repo.join(LOCK_FILE))
            .await
    }

    fn open_store(&self, proposal_id: DbId) -> Result<RevisionStore, VersioningError> {
        Ok(RevisionStore::open(self.repo_path(proposal_id))?)
    }

    fn require_owner(&self, proposal: &Proposal, caller: DbId) -> Result<User, VersioningError> {
        if !proposal.is_owned_by(caller) {
            return Err(VersioningError::Unauthorized(format!(
                "user {caller} does not own proposal {}",
                proposal.id
            )));
        }
        Ok(self.db.get_user(caller)?)
    }

    /// Contributor `contributor_id`, which must belong to `proposal_id`.
    fn contributor_of(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
    ) -> Result<Contributor, VersioningError> {
        self.db.get_proposal(proposal_id)?;
        let contributor = self.db.get_contributor(contributor_id)?;
        if contributor.proposal_id != proposal_id {
            return Err(VersioningError::not_found("contributor", contributor_id));
        }
        Ok(contributor)
    }

    /// The contributor plus its user, when `caller` is that user.
    fn require_contributor_caller(
        &self,
        proposal_id: DbId,
        contributor_id: DbId,
        caller: DbId,
    ) -> Result<(Contributor, User), VersioningError> {
        let contributor = self.contributor_of(proposal_id, contributor_id)?;
        if contributor.user_id != caller {
            return Err(VersioningError::Unauthorized(format!(
                "user {caller} does not own contributor {contributor_id}"
            )));
        }
        let user = self.db.get_user(caller)?;
        Ok((contributor, user))
    }

    /// Run the database half of an operation whose refs already moved.
    fn persist<T>(
        &self,
        store: &RevisionStore,
        edits: &[RefEdit],
        write: impl FnOnce(&Connection) -> Result<T, VersioningError>,
    ) -> Result<T, VersioningError> {
        let result = self.db.try_transaction(write);
        if let Err(ref e) = result {
            error!(error = %e, edits = edits.len(), "database update failed, undoing ref edits");
            self.compensate(store, edits);
        }
        result
    }

    fn compensate(&self, store: &RevisionStore, edits: &[RefEdit]) {
        if let Err(e) = VersionController::new(store).rollback(edits) {
            error!(
                error = %e,
                store = %store.path().display(),
                "could not undo ref edits; revision store and database disagree"
            );
        }
    }

    fn track(&self, handles: Vec<JoinHandle<()>>) {
        if handles.is_empty() {
            return;
        }
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.extend(handles);
            }
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }
}

/// The CAS edit `commit_edit` applied to `branch`.
fn advance_edit(branch: &BranchName, commit: &Commit) -> Vec<RefEdit> {
    commit
        .parent_ids
        .first()
        .map(|parent| RefEdit::Update {
            name: branch.clone().into(),
            expected: parent.clone(),
            target: commit.id.clone(),
        })
        .into_iter()
        .collect()
}

/// Point the record's cache at the working head.
fn sync_cache(proposal: &mut Proposal, snapshot: &Snapshot, head: &CommitId) {
    proposal.title = snapshot.title.clone();
    proposal.content = snapshot.content.clone();
    proposal.last_commit_id = head.to_string();
}

fn remove_repo(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "could not remove partially created store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;

    struct Fixture {
        _dir: tempfile::TempDir,
        service: ProposalService,
        owner: User,
        editor: User,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("draftline.db")).unwrap();
        db.initialize().unwrap();
        let notifier = Notifier::new(&NotificationConfig::default()).unwrap();
        let service = ProposalService::new(Arc::new(db), dir.path().join("repos"), notifier);
        let owner = service
            .register_user("owner", "Olive Owner", "olive@example.org")
            .unwrap();
        let editor = service
            .register_user("editor", "Eddie Editor", "eddie@example.org")
            .unwrap();
        Fixture {
            _dir: dir,
            service,
            owner,
            editor,
        }
    }

    #[tokio::test]
    async fn test_create_proposal() {
        let fx = fixture();
        let proposal = fx
            .service
            .create_proposal(fx.owner.id, "Bike lanes", "Paint them green")
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Draft);
        assert_eq!(proposal.version, Version::INITIAL);
        assert_eq!(proposal.working_branch, format!("proposal/{}", proposal.id));
        assert_eq!(proposal.last_commit_id.len(), 40);
        assert!(fx.service.repo_path(proposal.id).exists());
        assert_eq!(
            fx.service.working_snapshot(proposal.id).unwrap(),
            proposal.snapshot()
        );
    }

    #[tokio::test]
    async fn test_create_proposal_unknown_owner() {
        let fx = fixture();
        let err = fx.service.create_proposal(999, "t", "c").await.unwrap_err();
        assert!(matches!(err, VersioningError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let fx = fixture();
        assert!(matches!(
            fx.service.register_user("owner", "Again", "again@example.org"),
            Err(VersioningError::InvalidOperation(_))
        ));
        assert!(fx.service.register_user("x", "X", "not-an-email").is_err());
    }

    #[tokio::test]
    async fn test_only_owner_adds_contributors() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let err = fx
            .service
            .add_contributor(p.id, fx.editor.id, fx.editor.id, ContributorRole::Editor)
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::Unauthorized(_)));

        let c = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Editor)
            .await
            .unwrap();
        assert_eq!(c.branch, format!("proposal/{}/contributor/{}", p.id, c.id));
        let again = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Reviewer)
            .await;
        assert!(matches!(again, Err(VersioningError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_contributor_edit_rules() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let c = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Editor)
            .await
            .unwrap();

        // Someone else's contributor branch.
        let err = fx
            .service
            .edit_content(p.id, c.id, fx.owner.id, "x", "")
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::Unauthorized(_)));

        let commit = fx
            .service
            .edit_content(p.id, c.id, fx.editor.id, "new content", "reword")
            .await
            .unwrap();
        assert_eq!(commit.content, "new content");
        assert_eq!(commit.author.name, "Eddie Editor");
        // Contributor edits leave the working line and the record alone.
        assert_eq!(fx.service.get_proposal(p.id).unwrap().content, "c");

        fx.service
            .suspend_contributor(p.id, fx.owner.id, c.id)
            .await
            .unwrap();
        let err = fx
            .service
            .edit_title(p.id, c.id, fx.editor.id, "x", "")
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));

        fx.service
            .reactivate_contributor(p.id, fx.owner.id, c.id)
            .await
            .unwrap();
        fx.service
            .edit_title(p.id, c.id, fx.editor.id, "T2", "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_edit_working_updates_cache() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let commit = fx
            .service
            .edit_working(p.id, fx.owner.id, Field::Title, "Better title", "")
            .await
            .unwrap();
        let stored = fx.service.get_proposal(p.id).unwrap();
        assert_eq!(stored.title, "Better title");
        assert_eq!(stored.last_commit_id, commit.id.to_string());

        let err = fx
            .service
            .edit_working(p.id, fx.editor.id, Field::Title, "nope", "")
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_accept_merge_twice() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let c = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Editor)
            .await
            .unwrap();
        fx.service
            .edit_content(p.id, c.id, fx.editor.id, "merged body", "")
            .await
            .unwrap();
        let pr = fx
            .service
            .request_merge(p.id, c.id, fx.editor.id, "please")
            .await
            .unwrap();
        assert_eq!(pr.status, PullRequestStatus::Open);
        assert_eq!(pr.target_branch, p.working_branch);

        let err = fx
            .service
            .accept_merge(p.id, fx.editor.id, pr.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::Unauthorized(_)));

        fx.service
            .accept_merge(p.id, fx.owner.id, pr.id, None)
            .await
            .unwrap();
        assert_eq!(fx.service.get_proposal(p.id).unwrap().content, "merged body");

        let err = fx
            .service
            .accept_merge(p.id, fx.owner.id, pr.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_history_rejects_foreign_branch() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let history = fx
            .service
            .history(p.id, &BranchName::working(p.id), DEFAULT_HISTORY_LIMIT)
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(fx
            .service
            .history(p.id, &BranchName::working(p.id + 1), 10)
            .is_err());
    }

    #[tokio::test]
    async fn test_writer_waits_for_another_service() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let db = Database::new(fx._dir.path().join("draftline.db")).unwrap();
        let other = ProposalService::new(
            Arc::new(db),
            fx._dir.path().join("repos"),
            Notifier::new(&NotificationConfig::default()).unwrap(),
        );

        let held = fx.service.lock(p.id).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            other.edit_working(p.id, fx.owner.id, Field::Content, "theirs", ""),
        )
        .await;
        assert!(blocked.is_err(), "second service wrote while the lock was held");

        drop(held);
        other
            .edit_working(p.id, fx.owner.id, Field::Content, "theirs", "")
            .await
            .unwrap();
        assert_eq!(fx.service.get_proposal(p.id).unwrap().content, "theirs");
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow() {
        let fx = fixture();
        for title in ["a", "b", "c"] {
            let p = fx
                .service
                .create_proposal(fx.owner.id, title, "c")
                .await
                .unwrap();
            fx.service
                .edit_working(p.id, fx.owner.id, Field::Content, "d", "")
                .await
                .unwrap();
        }
        assert!(fx.service.locks.is_empty());
        assert!(matches!(
            fx.service.lock(404).await,
            Err(VersioningError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_add_contributor_keeps_existing_branch() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let store = fx.service.open_store(p.id).unwrap();
        // A branch left behind for the contributor id about to be assigned.
        let leftover = BranchName::contributor(p.id, 1);
        let head = store.resolve_branch(&BranchName::working(p.id)).unwrap();
        store.create_branch(&leftover, &head).unwrap();
        fx.service
            .db()
            .conn()
            .execute_batch(
                "CREATE TRIGGER fail_contributor_audit BEFORE INSERT ON audit_log
                 WHEN NEW.action = 'contributor_added'
                 BEGIN SELECT RAISE(ABORT, 'forced'); END;",
            )
            .unwrap();

        let result = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Editor)
            .await;
        assert!(result.is_err());
        assert_eq!(store.resolve_branch(&leftover).unwrap(), head);
        assert!(fx.service.list_contributors(p.id).unwrap().is_empty());

        // A branch this call created is removed again.
        store
            .apply_ref_edits(
                &[RefEdit::Delete {
                    name: leftover.clone().into(),
                    expected: head,
                }],
                "cleanup",
            )
            .unwrap();
        let result = fx
            .service
            .add_contributor(p.id, fx.owner.id, fx.editor.id, ContributorRole::Editor)
            .await;
        assert!(result.is_err());
        assert!(store.try_resolve_branch(&leftover).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_database_write_undoes_refs() {
        let fx = fixture();
        let p = fx
            .service
            .create_proposal(fx.owner.id, "t", "c")
            .await
            .unwrap();
        let store = fx.service.open_store(p.id).unwrap();
        let branch = BranchName::working(p.id);
        let before = store.resolve_branch(&branch).unwrap();
        let commit = BranchManager::new(&store)
            .commit_edit(&branch, Field::Content, "lost", &fx.owner.author(), "")
            .unwrap();

        let result: Result<(), VersioningError> =
            fx.service
                .persist(&store, &advance_edit(&branch, &commit), |_| {
                    Err(VersioningError::InvalidOperation("forced".into()))
                });
        assert!(result.is_err());
        assert_eq!(store.resolve_branch(&branch).unwrap(), before);
    }
}
