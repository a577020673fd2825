//! Publishing and reverting proposal versions.
//!
//! Publish lands the working line on `main` and tags the landed commit in a
//! single ref transaction. Revert walks one version back: it either resets
//! both lines to the previous tag or, when there is no earlier published
//! version, drops the proposal back to draft without touching any branch.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::errors::VersioningError;
use crate::merge::{MergeEngine, MergeKind};
use crate::models::{Author, Proposal, ProposalStatus, Snapshot};
use crate::store::{BranchName, CommitId, RefEdit, RevisionStore, TagName};
use crate::version::Version;

/// What a publish changed.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub version: Version,
    pub commit_id: CommitId,
    pub tag: String,
    pub merge: MergeKind,
    /// Ref edits applied, in order. Used to undo the publish.
    #[serde(skip)]
    pub edits: Vec<RefEdit>,
}

/// What a revert changed.
#[derive(Debug, Clone)]
pub enum RevertOutcome {
    /// Both lines were reset to the previous version's tag.
    Restored {
        version: Version,
        commit_id: CommitId,
        snapshot: Snapshot,
        abandoned_tag: Option<TagName>,
        edits: Vec<RefEdit>,
    },
    /// No earlier published version; the proposal is a draft again.
    BackToDraft {
        abandoned_tag: Option<TagName>,
        edits: Vec<RefEdit>,
    },
}

impl RevertOutcome {
    pub fn edits(&self) -> &[RefEdit] {
        match self {
            Self::Restored { edits, .. } | Self::BackToDraft { edits, .. } => edits,
        }
    }

    /// Version the proposal holds after the revert.
    pub fn version(&self) -> Version {
        match self {
            Self::Restored { version, .. } => *version,
            Self::BackToDraft { .. } => Version::INITIAL,
        }
    }

    pub fn status(&self) -> ProposalStatus {
        match self {
            Self::Restored { .. } => ProposalStatus::Published,
            Self::BackToDraft { .. } => ProposalStatus::Draft,
        }
    }
}

/// Assigns versions, tags releases and reverts them.
pub struct VersionController<'a> {
    store: &'a RevisionStore,
}

impl<'a> VersionController<'a> {
    pub fn new(store: &'a RevisionStore) -> Self {
        Self { store }
    }

    /// Merge the working line into `main` and tag the result with the next
    /// patch version.
    #[instrument(skip_all, fields(proposal_id = proposal.id, version = %proposal.version))]
    pub fn publish(
        &self,
        proposal: &Proposal,
        author: &Author,
    ) -> Result<PublishOutcome, VersioningError> {
        if proposal.status != ProposalStatus::Draft {
            return Err(VersioningError::InvalidOperation(format!(
                "proposal {} is already published at {}",
                proposal.id, proposal.version
            )));
        }
        let version = proposal.version.increment();
        let tag = TagName::new(proposal.id, version);
        if self.store.try_resolve_tag(&tag)?.is_some() {
            return Err(VersioningError::InvalidOperation(format!(
                "tag {tag} already exists"
            )));
        }

        let working = BranchName::working(proposal.id);
        let message = format!("Publish {tag}");
        let plan = MergeEngine::new(self.store).plan(
            &working,
            &BranchName::Main,
            author,
            Some(&message),
        )?;

        let mut edits: Vec<RefEdit> = plan.ref_edit().into_iter().collect();
        // Keep the working line on the published commit. When it is already
        // there the edit only checks that it has not moved since the plan.
        let working_target = if plan.kind == MergeKind::Merged {
            plan.new_head.clone()
        } else {
            plan.source_head.clone()
        };
        edits.push(RefEdit::Update {
            name: working.clone().into(),
            expected: plan.source_head.clone(),
            target: working_target,
        });
        edits.push(RefEdit::Create {
            name: tag.clone().into(),
            target: plan.new_head.clone(),
        });

        self.store.apply_ref_edits(&edits, &message)?;
        info!(%tag, head = %plan.new_head.short(), merge = %plan.kind, "published");
        Ok(PublishOutcome {
            version,
            commit_id: plan.new_head,
            tag: tag.to_string(),
            merge: plan.kind,
            edits,
        })
    }

    /// Step back to the previous published version.
    #[instrument(skip_all, fields(proposal_id = proposal.id, version = %proposal.version))]
    pub fn revert(&self, proposal: &Proposal) -> Result<RevertOutcome, VersioningError> {
        if proposal.status != ProposalStatus::Published {
            return Err(VersioningError::InvalidOperation(format!(
                "proposal {} is not published",
                proposal.id
            )));
        }

        let abandoned = TagName::new(proposal.id, proposal.version);
        let abandoned_head = self.store.try_resolve_tag(&abandoned)?;
        if abandoned_head.is_none() {
            warn!(tag = %abandoned, "tag of the published version is missing");
        }
        let mut edits: Vec<RefEdit> = abandoned_head
            .map(|expected| RefEdit::Delete {
                name: abandoned.clone().into(),
                expected,
            })
            .into_iter()
            .collect();
        let abandoned_tag = (!edits.is_empty()).then(|| abandoned.clone());

        let previous = match proposal.version.decrement() {
            Some(previous) if !previous.is_initial() => previous,
            _ => {
                if !edits.is_empty() {
                    self.store
                        .apply_ref_edits(&edits, &format!("Withdraw {abandoned}"))?;
                }
                info!(tag = %abandoned, "no earlier version, back to draft");
                return Ok(RevertOutcome::BackToDraft {
                    abandoned_tag,
                    edits,
                });
            }
        };

        let target_tag = TagName::new(proposal.id, previous);
        let target = self.store.try_resolve_tag(&target_tag)?.ok_or_else(|| {
            VersioningError::RevertTargetNotFound {
                tag: target_tag.to_string(),
            }
        })?;

        let mut resets = Vec::new();
        for branch in [BranchName::working(proposal.id), BranchName::Main] {
            match self.store.try_resolve_branch(&branch)? {
                Some(head) if head == target => {}
                Some(head) => resets.push(RefEdit::Update {
                    name: branch.into(),
                    expected: head,
                    target: target.clone(),
                }),
                None => resets.push(RefEdit::Create {
                    name: branch.into(),
                    target: target.clone(),
                }),
            }
        }
        resets.append(&mut edits);
        let edits = resets;

        self.store
            .apply_ref_edits(&edits, &format!("Revert to {target_tag}"))?;
        let snapshot = self.store.read_snapshot(&target)?;
        info!(tag = %target_tag, head = %target.short(), "reverted");
        Ok(RevertOutcome::Restored {
            version: previous,
            commit_id: target,
            snapshot,
            abandoned_tag,
            edits,
        })
    }

    /// Undo previously applied edits, newest first.
    ///
    /// Used when the relational record could not be updated after the refs
    /// moved.
    pub fn rollback(&self, edits: &[RefEdit]) -> Result<(), VersioningError> {
        if edits.is_empty() {
            return Ok(());
        }
        let inverse: Vec<RefEdit> = edits
            .iter()
            .rev()
            .filter(|edit| !edit.is_noop())
            .map(RefEdit::inverse)
            .collect();
        if inverse.is_empty() {
            return Ok(());
        }
        self.store.apply_ref_edits(&inverse, "rollback")?;
        warn!(count = inverse.len(), "rolled back ref edits");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchManager;
    use crate::models::Field;
    use chrono::Utc;

    fn author() -> Author {
        Author::new("Owner", "owner@example.org")
    }

    fn proposal(version: Version, status: ProposalStatus, head: &CommitId) -> Proposal {
        let now = Utc::now();
        Proposal {
            id: 3,
            owner_id: 1,
            title: String::new(),
            content: String::new(),
            version,
            status,
            working_branch: BranchName::working(3).to_string(),
            last_commit_id: head.to_string(),
            published_commit_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn setup() -> (tempfile::TempDir, RevisionStore, CommitId) {
        let dir = tempfile::tempdir().unwrap();
        let store = RevisionStore::init(dir.path().join("3.git")).unwrap();
        let (_, commit) = BranchManager::new(&store)
            .create_working_branch(3, &Snapshot::new("Title", "Body"), &author())
            .unwrap();
        (dir, store, commit.id)
    }

    #[test]
    fn test_first_publish_creates_main_and_tag() {
        let (_dir, store, head) = setup();
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let outcome = VersionController::new(&store)
            .publish(&draft, &author())
            .unwrap();
        assert_eq!(outcome.version.to_string(), "0.0.1");
        assert_eq!(outcome.tag, "3-0.0.1");
        assert_eq!(outcome.merge, MergeKind::Created);
        assert_eq!(outcome.commit_id, head);
        assert_eq!(store.resolve_branch(&BranchName::Main).unwrap(), head);
        assert_eq!(
            store.resolve_tag(&TagName::new(3, outcome.version)).unwrap(),
            head
        );
    }

    #[test]
    fn test_publish_checks_working_head() {
        let (_dir, store, head) = setup();
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let outcome = VersionController::new(&store)
            .publish(&draft, &author())
            .unwrap();
        assert!(outcome.edits.contains(&RefEdit::Update {
            name: BranchName::working(3).into(),
            expected: head.clone(),
            target: head,
        }));
    }

    #[test]
    fn test_rollback_skips_checks_on_moved_working_line() {
        let (_dir, store, head) = setup();
        let controller = VersionController::new(&store);
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let outcome = controller.publish(&draft, &author()).unwrap();

        // Another writer advances the working line before the undo.
        let later = BranchManager::new(&store)
            .commit_edit(&BranchName::working(3), Field::Content, "Later", &author(), "")
            .unwrap();
        controller.rollback(&outcome.edits).unwrap();
        assert!(store.try_resolve_branch(&BranchName::Main).unwrap().is_none());
        assert!(store
            .try_resolve_tag(&TagName::new(3, outcome.version))
            .unwrap()
            .is_none());
        assert_eq!(
            store.resolve_branch(&BranchName::working(3)).unwrap(),
            later.id
        );
    }

    #[test]
    fn test_publish_requires_draft() {
        let (_dir, store, head) = setup();
        let published = proposal(Version::new(0, 0, 1), ProposalStatus::Published, &head);
        let err = VersionController::new(&store)
            .publish(&published, &author())
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));
    }

    #[test]
    fn test_publish_refuses_existing_tag() {
        let (_dir, store, head) = setup();
        store
            .create_tag(&TagName::new(3, Version::new(0, 0, 1)), &head)
            .unwrap();
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let err = VersionController::new(&store)
            .publish(&draft, &author())
            .unwrap_err();
        assert!(matches!(err, VersioningError::InvalidOperation(_)));
        assert!(store.try_resolve_branch(&BranchName::Main).unwrap().is_none());
    }

    #[test]
    fn test_terminal_revert_deletes_tag_only() {
        let (_dir, store, head) = setup();
        let controller = VersionController::new(&store);
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let published = controller.publish(&draft, &author()).unwrap();

        let current = proposal(published.version, ProposalStatus::Published, &head);
        let outcome = controller.revert(&current).unwrap();
        assert_eq!(outcome.status(), ProposalStatus::Draft);
        assert_eq!(outcome.version(), Version::INITIAL);
        assert!(store
            .try_resolve_tag(&TagName::new(3, published.version))
            .unwrap()
            .is_none());
        // Branches are left where they were.
        assert_eq!(store.resolve_branch(&BranchName::Main).unwrap(), head);
        assert_eq!(store.resolve_branch(&BranchName::working(3)).unwrap(), head);
    }

    #[test]
    fn test_revert_resets_both_lines_to_previous_tag() {
        let (_dir, store, first) = setup();
        let controller = VersionController::new(&store);
        let v1 = Version::new(0, 0, 1);
        let v2 = Version::new(0, 0, 2);
        store.create_tag(&TagName::new(3, v1), &first).unwrap();
        store.create_branch(&BranchName::Main, &first).unwrap();

        let edited = BranchManager::new(&store)
            .commit_edit(
                &BranchName::working(3),
                Field::Content,
                "Second body",
                &author(),
                "",
            )
            .unwrap();
        store
            .advance_branch(&BranchName::Main, &first, &edited.id)
            .unwrap();
        store.create_tag(&TagName::new(3, v2), &edited.id).unwrap();

        let current = proposal(v2, ProposalStatus::Published, &edited.id);
        let outcome = controller.revert(&current).unwrap();
        match &outcome {
            RevertOutcome::Restored {
                version,
                commit_id,
                snapshot,
                abandoned_tag,
                ..
            } => {
                assert_eq!(*version, v1);
                assert_eq!(*commit_id, first);
                assert_eq!(snapshot, &Snapshot::new("Title", "Body"));
                assert_eq!(abandoned_tag.as_ref(), Some(&TagName::new(3, v2)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.resolve_branch(&BranchName::Main).unwrap(), first);
        assert_eq!(store.resolve_branch(&BranchName::working(3)).unwrap(), first);
        assert!(store.try_resolve_tag(&TagName::new(3, v2)).unwrap().is_none());

        // Undo puts everything back.
        controller.rollback(outcome.edits()).unwrap();
        assert_eq!(store.resolve_branch(&BranchName::Main).unwrap(), edited.id);
        assert_eq!(store.resolve_tag(&TagName::new(3, v2)).unwrap(), edited.id);
    }

    #[test]
    fn test_revert_without_previous_tag() {
        let (_dir, store, head) = setup();
        let current = proposal(Version::new(0, 0, 2), ProposalStatus::Published, &head);
        let err = VersionController::new(&store).revert(&current).unwrap_err();
        assert!(matches!(
            err,
            VersioningError::RevertTargetNotFound { ref tag } if tag == "3-0.0.1"
        ));
    }

    #[test]
    fn test_revert_requires_published() {
        let (_dir, store, head) = setup();
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        assert!(matches!(
            VersionController::new(&store).revert(&draft),
            Err(VersioningError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_rollback_publish() {
        let (_dir, store, head) = setup();
        let controller = VersionController::new(&store);
        let draft = proposal(Version::INITIAL, ProposalStatus::Draft, &head);
        let outcome = controller.publish(&draft, &author()).unwrap();
        controller.rollback(&outcome.edits).unwrap();
        assert!(store.try_resolve_branch(&BranchName::Main).unwrap().is_none());
        assert!(store
            .try_resolve_tag(&TagName::new(3, outcome.version))
            .unwrap()
            .is_none());
    }
}
