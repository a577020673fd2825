//! Merge engine for proposal branches.
//!
//! A proposal snapshot has exactly two independent fields, so a three-way
//! merge is decided per field: a side that left the field at its base value
//! yields to the side that changed it, identical changes agree, and
//! different changes conflict. Conflicts abort the merge; nothing is
//! auto-resolved. The `diffy` crate is only used to render the competing
//! edits for the person who has to re-submit.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::VersioningError;
use crate::models::{Author, Snapshot};
use crate::store::{BranchName, CommitId, RefEdit, RevisionStore};

pub use crate::models::Field;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Both sides changed `field` to different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: Field,
    /// Value at the merge base.
    pub base: String,
    /// Value on the target branch.
    pub ours: String,
    /// Value on the source branch.
    pub theirs: String,
}

impl FieldConflict {
    /// Unified diffs of both sides against the base, target first.
    pub fn render_diff(&self) -> String {
        let ours = diffy::create_patch(&self.base, &self.ours);
        let theirs = diffy::create_patch(&self.base, &self.theirs);
        format!(
            "# {field}: target branch\n{ours}# {field}: source branch\n{theirs}",
            field = self.field
        )
    }
}

/// How a merge moved (or did not move) the target branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Target did not exist and was created at the source head.
    Created,
    /// Target head was an ancestor of the source head.
    FastForward,
    /// A two-parent merge commit was written.
    Merged,
    /// Source head was already contained in the target.
    UpToDate,
}

impl std::fmt::Display for MergeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::FastForward => write!(f, "fast_forward"),
            Self::Merged => write!(f, "merged"),
            Self::UpToDate => write!(f, "up_to_date"),
        }
    }
}

/// A computed merge that has not moved any ref yet.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub source: BranchName,
    pub target: BranchName,
    pub source_head: CommitId,
    pub target_head: Option<CommitId>,
    pub new_head: CommitId,
    pub kind: MergeKind,
}

impl MergePlan {
    /// The ref change that lands this plan, if any.
    pub fn ref_edit(&self) -> Option<RefEdit> {
        match (&self.kind, &self.target_head) {
            (MergeKind::UpToDate, _) => None,
            (_, None) => Some(RefEdit::Create {
                name: self.target.clone().into(),
                target: self.new_head.clone(),
            }),
            (_, Some(expected)) => Some(RefEdit::Update {
                name: self.target.clone().into(),
                expected: expected.clone(),
                target: self.new_head.clone(),
            }),
        }
    }
}

/// Result of a landed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub kind: MergeKind,
    pub head: CommitId,
    /// The ref change that was applied, kept so a caller can undo it.
    #[serde(skip)]
    pub applied: Option<RefEdit>,
}

// ---------------------------------------------------------------------------
// Field merge
// ---------------------------------------------------------------------------

/// Three-way merge of two snapshots against their common base.
///
/// `ours` is the target side, `theirs` the source side.
pub fn merge_snapshots(
    base: &Snapshot,
    ours: &Snapshot,
    theirs: &Snapshot,
) -> Result<Snapshot, Vec<FieldConflict>> {
    let mut merged = ours.clone();
    let mut conflicts = Vec::new();

    for field in Field::ALL {
        let (b, o, t) = (field.get(base), field.get(ours), field.get(theirs));
        if o == t || t == b {
            continue;
        }
        if o == b {
            merged = field.set(&merged, t);
            continue;
        }
        conflicts.push(FieldConflict {
            field,
            base: b.to_string(),
            ours: o.to_string(),
            theirs: t.to_string(),
        });
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(conflicts)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Merges one branch of a proposal store into another.
pub struct MergeEngine<'a> {
    store: &'a RevisionStore,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a RevisionStore) -> Self {
        Self { store }
    }

    /// Work out what merging `source` into `target` would do.
    ///
    /// A merge commit is written to the object store when needed, but no ref
    /// moves. Returns [`VersioningError::MergeConflict`] when both sides
    /// changed a field differently.
    #[instrument(skip_all, fields(source = %source, target = %target))]
    pub fn plan(
        &self,
        source: &BranchName,
        target: &BranchName,
        author: &Author,
        message: Option<&str>,
    ) -> Result<MergePlan, VersioningError> {
        let source_head = self.store.resolve_branch(source)?;
        let target_head = self.store.try_resolve_branch(target)?;

        let plan = |new_head: CommitId, kind: MergeKind| MergePlan {
            source: source.clone(),
            target: target.clone(),
            source_head: source_head.clone(),
            target_head: target_head.clone(),
            new_head,
            kind,
        };

        let Some(target_id) = target_head.clone() else {
            debug!("target branch missing, creating it at source head");
            return Ok(plan(source_head.clone(), MergeKind::Created));
        };

        if self.store.is_ancestor(&source_head, &target_id)? {
            debug!("source already contained in target");
            return Ok(plan(target_id, MergeKind::UpToDate));
        }
        if self.store.is_ancestor(&target_id, &source_head)? {
            debug!("fast-forward");
            return Ok(plan(source_head.clone(), MergeKind::FastForward));
        }

        let base_id = self
            .store
            .merge_base(&source_head, &target_id)?
            .ok_or_else(|| {
                VersioningError::InvalidOperation(format!(
                    "{source} and {target} share no history"
                ))
            })?;

        let base = self.store.read_snapshot(&base_id)?;
        let ours = self.store.read_snapshot(&target_id)?;
        let theirs = self.store.read_snapshot(&source_head)?;

        let merged = merge_snapshots(&base, &ours, &theirs).map_err(|fields| {
            warn!(
                conflicts = fields.len(),
                base = %base_id.short(),
                "merge aborted on field conflict"
            );
            VersioningError::MergeConflict { fields }
        })?;

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Merge {source} into {target}"));
        let commit = self.store.create_commit(
            &[source_head.clone(), target_id],
            &merged,
            author,
            &message,
        )?;
        Ok(plan(commit.id, MergeKind::Merged))
    }

    /// Plan and land a merge of `source` into `target`.
    pub fn merge(
        &self,
        source: &BranchName,
        target: &BranchName,
        author: &Author,
        message: Option<&str>,
    ) -> Result<MergeOutcome, VersioningError> {
        let plan = self.plan(source, target, author, message)?;
        let applied = plan.ref_edit();
        if let Some(edit) = &applied {
            self.store
                .apply_ref_edits(std::slice::from_ref(edit), &format!("merge: {source} into {target}"))?;
        }
        info!(
            %source,
            %target,
            kind = %plan.kind,
            head = %plan.new_head.short(),
            "merge landed"
        );
        Ok(MergeOutcome {
            kind: plan.kind,
            head: plan.new_head,
            applied,
        })
    }
}
