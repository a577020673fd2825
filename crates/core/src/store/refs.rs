//! Typed branch and tag names.
//!
//! Logical branch names (`main`, `proposal/<id>`,
//! `proposal/<id>/contributor/<cid>`) are what users and the relational
//! record see. Git cannot hold `refs/heads/proposal/7` and
//! `refs/heads/proposal/7/contributor/3` at the same time, so the working
//! line is stored under `refs/heads/proposal/<id>/working`.

use std::fmt;

use crate::errors::StoreError;
use crate::models::DbId;
use crate::version::Version;

use super::CommitId;

const MAIN_REF: &str = "refs/heads/main";
const HEADS_PREFIX: &str = "refs/heads/";
const TAGS_PREFIX: &str = "refs/tags/";

/// One of the three branch kinds a proposal repository holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchName {
    /// The published line.
    Main,
    /// The proposal's working line.
    Working { proposal_id: DbId },
    /// A contributor's isolated line.
    Contributor {
        proposal_id: DbId,
        contributor_id: DbId,
    },
}

impl BranchName {
    pub fn working(proposal_id: DbId) -> Self {
        Self::Working { proposal_id }
    }

    pub fn contributor(proposal_id: DbId, contributor_id: DbId) -> Self {
        Self::Contributor {
            proposal_id,
            contributor_id,
        }
    }

    /// Full git ref backing this branch.
    pub fn ref_name(&self) -> String {
        match self {
            Self::Main => MAIN_REF.to_string(),
            Self::Working { proposal_id } => {
                format!("{HEADS_PREFIX}proposal/{proposal_id}/working")
            }
            Self::Contributor {
                proposal_id,
                contributor_id,
            } => format!("{HEADS_PREFIX}proposal/{proposal_id}/contributor/{contributor_id}"),
        }
    }

    /// Parse a logical name such as `proposal/7/contributor/3`.
    pub fn parse(logical: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidName(logical.to_string());
        let parts: Vec<&str> = logical.split('/').collect();
        match parts.as_slice() {
            ["main"] => Ok(Self::Main),
            ["proposal", id] => Ok(Self::working(parse_id(id).ok_or_else(invalid)?)),
            ["proposal", id, "contributor", cid] => Ok(Self::contributor(
                parse_id(id).ok_or_else(invalid)?,
                parse_id(cid).ok_or_else(invalid)?,
            )),
            _ => Err(invalid()),
        }
    }

    /// Map a full git ref back to its logical branch, if it is one of ours.
    pub fn from_ref_name(full: &str) -> Option<Self> {
        if full == MAIN_REF {
            return Some(Self::Main);
        }
        let rest = full.strip_prefix(HEADS_PREFIX)?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            ["proposal", id, "working"] => Some(Self::working(parse_id(id)?)),
            ["proposal", id, "contributor", cid] => {
                Some(Self::contributor(parse_id(id)?, parse_id(cid)?))
            }
            _ => None,
        }
    }

    pub fn proposal_id(&self) -> Option<DbId> {
        match self {
            Self::Main => None,
            Self::Working { proposal_id } | Self::Contributor { proposal_id, .. } => {
                Some(*proposal_id)
            }
        }
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main"),
            Self::Working { proposal_id } => write!(f, "proposal/{proposal_id}"),
            Self::Contributor {
                proposal_id,
                contributor_id,
            } => write!(f, "proposal/{proposal_id}/contributor/{contributor_id}"),
        }
    }
}

fn parse_id(s: &str) -> Option<DbId> {
    s.parse::<DbId>().ok().filter(|id| *id > 0)
}

/// A release tag, `<proposalId>-<semver>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagName {
    pub proposal_id: DbId,
    pub version: Version,
}

impl TagName {
    pub fn new(proposal_id: DbId, version: Version) -> Self {
        Self {
            proposal_id,
            version,
        }
    }

    pub fn ref_name(&self) -> String {
        format!("{TAGS_PREFIX}{self}")
    }

    /// Parse `<proposalId>-<semver>`.
    pub fn parse(name: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidName(name.to_string());
        let (id, version) = name.split_once('-').ok_or_else(invalid)?;
        Ok(Self::new(
            parse_id(id).ok_or_else(invalid)?,
            version.parse().map_err(|_| invalid())?,
        ))
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.proposal_id, self.version)
    }
}

/// Any ref the store can move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefName {
    Branch(BranchName),
    Tag(TagName),
}

impl RefName {
    pub fn full_name(&self) -> String {
        match self {
            Self::Branch(b) => b.ref_name(),
            Self::Tag(t) => t.ref_name(),
        }
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(b) => write!(f, "{b}"),
            Self::Tag(t) => write!(f, "{t}"),
        }
    }
}

impl From<BranchName> for RefName {
    fn from(b: BranchName) -> Self {
        Self::Branch(b)
    }
}

impl From<TagName> for RefName {
    fn from(t: TagName) -> Self {
        Self::Tag(t)
    }
}

/// One compare-and-swap ref change inside an atomic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefEdit {
    /// The ref must not exist yet.
    Create { name: RefName, target: CommitId },
    /// The ref must currently point at `expected`.
    Update {
        name: RefName,
        expected: CommitId,
        target: CommitId,
    },
    /// The ref must currently point at `expected`.
    Delete { name: RefName, expected: CommitId },
}

impl RefEdit {
    pub fn name(&self) -> &RefName {
        match self {
            Self::Create { name, .. } | Self::Update { name, .. } | Self::Delete { name, .. } => {
                name
            }
        }
    }

    /// An update that leaves the ref where it is. Applying one only checks
    /// the ref's current value.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Update { expected, target, .. } if expected == target)
    }

    /// The edit that undoes this one.
    pub fn inverse(&self) -> RefEdit {
        match self {
            Self::Create { name, target } => Self::Delete {
                name: name.clone(),
                expected: target.clone(),
            },
            Self::Update {
                name,
                expected,
                target,
            } => Self::Update {
                name: name.clone(),
                expected: target.clone(),
                target: expected.clone(),
            },
            Self::Delete { name, expected } => Self::Create {
                name: name.clone(),
                target: expected.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_names() {
        assert_eq!(BranchName::Main.to_string(), "main");
        assert_eq!(BranchName::working(7).to_string(), "proposal/7");
        assert_eq!(
            BranchName::contributor(7, 3).to_string(),
            "proposal/7/contributor/3"
        );
    }

    #[test]
    fn test_ref_names_do_not_nest() {
        let working = BranchName::working(7).ref_name();
        let contributor = BranchName::contributor(7, 3).ref_name();
        assert_eq!(working, "refs/heads/proposal/7/working");
        assert!(!contributor.starts_with(&format!("{working}/")));
    }

    #[test]
    fn test_parse_logical_and_ref() {
        for name in [
            BranchName::Main,
            BranchName::working(12),
            BranchName::contributor(12, 4),
        ] {
            assert_eq!(BranchName::parse(&name.to_string()).unwrap(), name);
            assert_eq!(BranchName::from_ref_name(&name.ref_name()), Some(name));
        }
        assert!(BranchName::parse("proposal/x").is_err());
        assert!(BranchName::parse("proposal/0").is_err());
        assert!(BranchName::parse("feature/1").is_err());
        assert_eq!(BranchName::from_ref_name("refs/heads/topic"), None);
    }

    #[test]
    fn test_tag_name() {
        let tag = TagName::new(5, Version::new(0, 0, 2));
        assert_eq!(tag.to_string(), "5-0.0.2");
        assert_eq!(tag.ref_name(), "refs/tags/5-0.0.2");
        assert_eq!(TagName::parse("5-0.0.2").unwrap(), tag);
        assert!(TagName::parse("5-abc").is_err());
        assert!(TagName::parse("0.0.2").is_err());
    }

    #[test]
    fn test_inverse_edits() {
        let name: RefName = BranchName::Main.into();
        let a = CommitId::new("a".repeat(40));
        let b = CommitId::new("b".repeat(40));
        let update = RefEdit::Update {
            name: name.clone(),
            expected: a.clone(),
            target: b.clone(),
        };
        assert_eq!(update.inverse().inverse(), update);
        assert!(!update.is_noop());
        let check = RefEdit::Update {
            name: name.clone(),
            expected: a.clone(),
            target: a.clone(),
        };
        assert!(check.is_noop());
        let create = RefEdit::Create {
            name: name.clone(),
            target: a.clone(),
        };
        assert_eq!(
            create.inverse(),
            RefEdit::Delete {
                name,
                expected: a
            }
        );
    }
}
