//! Typed query helpers for every table in the Draftline database.
//!
//! The free functions take a bare `&Connection` so that the proposal service
//! can compose several of them inside one [`Database::try_transaction`]. The
//! read-only ones are also exposed as methods on [`Database`].

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    AuditAction, AuditEntry, Contributor, ContributorRole, ContributorStatus, DbId, Proposal,
    ProposalStatus, PullRequest, PullRequestStatus, User,
};
use crate::version::Version;

const USER_COLUMNS: &str = "id, username, display_name, email, created_at";
const PROPOSAL_COLUMNS: &str = "id, owner_id, title, content, version, status, working_branch, \
     last_commit_id, published_commit_id, created_at, updated_at";
const CONTRIBUTOR_COLUMNS: &str =
    "id, proposal_id, user_id, role, status, branch, created_at";
const PULL_REQUEST_COLUMNS: &str = "id, proposal_id, contributor_id, source_branch, \
     target_branch, description, status, merge_commit_id, created_at, merged_at";

fn not_found(entity: &str, id: impl ToString) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// users
// ---------------------------------------------------------------------------

/// Insert a user and return it.
pub fn insert_user(
    conn: &Connection,
    username: &str,
    display_name: &str,
    email: &str,
) -> Result<User, DatabaseError> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO users (username, display_name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![username, display_name, email, now.to_rfc3339()],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, username, "inserted user");
    Ok(User {
        id,
        username: username.to_string(),
        display_name: display_name.to_string(),
        email: email.to_string(),
        created_at: now,
    })
}

pub fn get_user(conn: &Connection, id: DbId) -> Result<User, DatabaseError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![id],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("user", id))
}

pub fn find_user_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<User>, DatabaseError> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            params![username],
            user_from_row,
        )
        .optional()?)
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

// ---------------------------------------------------------------------------
// proposals
// ---------------------------------------------------------------------------

/// Insert a fresh draft at version 0.0.0 and return its id.
///
/// The working branch and head are filled in by [`update_proposal`] once the
/// revision store exists.
pub fn insert_proposal(
    conn: &Connection,
    owner_id: DbId,
    title: &str,
    content: &str,
) -> Result<DbId, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO proposals (owner_id, title, content, version, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            owner_id,
            title,
            content,
            Version::INITIAL.to_string(),
            ProposalStatus::Draft.as_str(),
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, owner_id, "inserted proposal");
    Ok(id)
}

pub fn get_proposal(conn: &Connection, id: DbId) -> Result<Proposal, DatabaseError> {
    conn.query_row(
        &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1"),
        params![id],
        proposal_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("proposal", id))
}

pub fn list_proposals(conn: &Connection) -> Result<Vec<Proposal>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROPOSAL_COLUMNS} FROM proposals ORDER BY id"
    ))?;
    let proposals = stmt
        .query_map([], proposal_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(proposals)
}

/// Write every mutable column of `proposal` and bump `updated_at`.
pub fn update_proposal(conn: &Connection, proposal: &Proposal) -> Result<(), DatabaseError> {
    if write_proposal(conn, proposal, None)? == 0 {
        return Err(not_found("proposal", proposal.id));
    }
    Ok(())
}

/// Like [`update_proposal`], but only if the row still holds the head,
/// status and version of `prior`, the copy the caller read before moving
/// refs. Fails with [`DatabaseError::StaleProposal`] otherwise.
pub fn update_proposal_checked(
    conn: &Connection,
    prior: &Proposal,
    proposal: &Proposal,
) -> Result<(), DatabaseError> {
    if write_proposal(conn, proposal, Some(prior))? == 0 {
        get_proposal(conn, proposal.id)?;
        debug!(id = proposal.id, expected = %prior.last_commit_id, "proposal row is stale");
        return Err(DatabaseError::StaleProposal { id: proposal.id });
    }
    Ok(())
}

fn write_proposal(
    conn: &Connection,
    proposal: &Proposal,
    prior: Option<&Proposal>,
) -> Result<usize, DatabaseError> {
    let mut sql = String::from(
        "UPDATE proposals SET title = ?1, content = ?2, version = ?3, status = ?4,
             working_branch = ?5, last_commit_id = ?6, published_commit_id = ?7,
             updated_at = ?8
         WHERE id = ?9",
    );
    if prior.is_some() {
        sql.push_str(" AND last_commit_id = ?10 AND status = ?11 AND version = ?12");
    }
    let version = proposal.version.to_string();
    let now = Utc::now().to_rfc3339();
    let changed = match prior {
        None => conn.execute(
            &sql,
            params![
                proposal.title,
                proposal.content,
                version,
                proposal.status.as_str(),
                proposal.working_branch,
                proposal.last_commit_id,
                proposal.published_commit_id,
                now,
                proposal.id
            ],
        )?,
        Some(prior) => conn.execute(
            &sql,
            params![
                proposal.title,
                proposal.content,
                version,
                proposal.status.as_str(),
                proposal.working_branch,
                proposal.last_commit_id,
                proposal.published_commit_id,
                now,
                proposal.id,
                prior.last_commit_id,
                prior.status.as_str(),
                prior.version.to_string()
            ],
        )?,
    };
    if changed > 0 {
        debug!(
            id = proposal.id,
            version = %proposal.version,
            status = proposal.status.as_str(),
            "updated proposal"
        );
    }
    Ok(changed)
}

fn proposal_from_row(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    Ok(Proposal {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        version: parse_column(row, 4, "proposals.version", |s| s.parse::<Version>().ok())?,
        status: parse_column(row, 5, "proposals.status", ProposalStatus::parse)?,
        working_branch: row.get(6)?,
        last_commit_id: row.get(7)?,
        published_commit_id: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

// ---------------------------------------------------------------------------
// contributors
// ---------------------------------------------------------------------------

/// Insert an ACTIVE contributor. The branch column starts empty.
pub fn insert_contributor(
    conn: &Connection,
    proposal_id: DbId,
    user_id: DbId,
    role: ContributorRole,
) -> Result<DbId, DatabaseError> {
    conn.execute(
        "INSERT INTO contributors (proposal_id, user_id, role, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            proposal_id,
            user_id,
            role.as_str(),
            ContributorStatus::Active.as_str(),
            Utc::now().to_rfc3339()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, proposal_id, user_id, "inserted contributor");
    Ok(id)
}

pub fn set_contributor_branch(
    conn: &Connection,
    id: DbId,
    branch: &str,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE contributors SET branch = ?1 WHERE id = ?2",
        params![branch, id],
    )?;
    if changed == 0 {
        return Err(not_found("contributor", id));
    }
    Ok(())
}

pub fn set_contributor_status(
    conn: &Connection,
    id: DbId,
    status: ContributorStatus,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE contributors SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    if changed == 0 {
        return Err(not_found("contributor", id));
    }
    debug!(id, status = status.as_str(), "updated contributor status");
    Ok(())
}

pub fn get_contributor(conn: &Connection, id: DbId) -> Result<Contributor, DatabaseError> {
    conn.query_row(
        &format!("SELECT {CONTRIBUTOR_COLUMNS} FROM contributors WHERE id = ?1"),
        params![id],
        contributor_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("contributor", id))
}

pub fn find_contributor(
    conn: &Connection,
    proposal_id: DbId,
    user_id: DbId,
) -> Result<Option<Contributor>, DatabaseError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {CONTRIBUTOR_COLUMNS} FROM contributors
                 WHERE proposal_id = ?1 AND user_id = ?2"
            ),
            params![proposal_id, user_id],
            contributor_from_row,
        )
        .optional()?)
}

pub fn list_contributors(
    conn: &Connection,
    proposal_id: DbId,
) -> Result<Vec<Contributor>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTRIBUTOR_COLUMNS} FROM contributors WHERE proposal_id = ?1 ORDER BY id"
    ))?;
    let contributors = stmt
        .query_map(params![proposal_id], contributor_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(contributors)
}

fn contributor_from_row(row: &Row<'_>) -> rusqlite::Result<Contributor> {
    Ok(Contributor {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        user_id: row.get(2)?,
        role: parse_column(row, 3, "contributors.role", ContributorRole::parse)?,
        status: parse_column(row, 4, "contributors.status", ContributorStatus::parse)?,
        branch: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

// ---------------------------------------------------------------------------
// pull_requests
// ---------------------------------------------------------------------------

/// Insert an OPEN pull request and return its id.
pub fn insert_pull_request(
    conn: &Connection,
    proposal_id: DbId,
    contributor_id: DbId,
    source_branch: &str,
    target_branch: &str,
    description: &str,
) -> Result<DbId, DatabaseError> {
    conn.execute(
        "INSERT INTO pull_requests
             (proposal_id, contributor_id, source_branch, target_branch, description, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            proposal_id,
            contributor_id,
            source_branch,
            target_branch,
            description,
            PullRequestStatus::Open.as_str(),
            Utc::now().to_rfc3339()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, proposal_id, contributor_id, "inserted pull request");
    Ok(id)
}

pub fn get_pull_request(conn: &Connection, id: DbId) -> Result<PullRequest, DatabaseError> {
    conn.query_row(
        &format!("SELECT {PULL_REQUEST_COLUMNS} FROM pull_requests WHERE id = ?1"),
        params![id],
        pull_request_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("pull request", id))
}

/// Pull requests of a proposal, newest first, optionally filtered by status.
pub fn list_pull_requests(
    conn: &Connection,
    proposal_id: DbId,
    status: Option<PullRequestStatus>,
) -> Result<Vec<PullRequest>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PULL_REQUEST_COLUMNS} FROM pull_requests
         WHERE proposal_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY id DESC"
    ))?;
    let prs = stmt
        .query_map(
            params![proposal_id, status.map(|s| s.as_str())],
            pull_request_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(prs)
}

/// Flip an OPEN pull request to MERGED.
pub fn mark_pull_request_merged(
    conn: &Connection,
    id: DbId,
    merge_commit_id: &str,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE pull_requests SET status = ?1, merge_commit_id = ?2, merged_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            PullRequestStatus::Merged.as_str(),
            merge_commit_id,
            Utc::now().to_rfc3339(),
            id,
            PullRequestStatus::Open.as_str()
        ],
    )?;
    if changed == 0 {
        return Err(not_found("open pull request", id));
    }
    debug!(id, merge_commit_id, "pull request merged");
    Ok(())
}

fn pull_request_from_row(row: &Row<'_>) -> rusqlite::Result<PullRequest> {
    Ok(PullRequest {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        contributor_id: row.get(2)?,
        source_branch: row.get(3)?,
        target_branch: row.get(4)?,
        description: row.get(5)?,
        status: parse_column(row, 6, "pull_requests.status", PullRequestStatus::parse)?,
        merge_commit_id: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        merged_at: row
            .get::<_, Option<String>>(9)?
            .as_deref()
            .map(parse_datetime),
    })
}

// ---------------------------------------------------------------------------
// audit_log
// ---------------------------------------------------------------------------

/// Insert an audit-log entry.
pub fn insert_audit(
    conn: &Connection,
    action: AuditAction,
    proposal_id: Option<DbId>,
    actor_id: Option<DbId>,
    commit_id: Option<&str>,
    details: Option<&str>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (action, proposal_id, actor_id, commit_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            action.as_str(),
            proposal_id,
            actor_id,
            commit_id,
            details,
            Utc::now().to_rfc3339()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, action = action.as_str(), "inserted audit_log entry");
    Ok(id)
}

/// Recent audit entries, newest first.
pub fn list_audit(
    conn: &Connection,
    proposal_id: Option<DbId>,
    limit: u32,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, action, proposal_id, actor_id, commit_id, details, created_at
         FROM audit_log WHERE (?1 IS NULL OR proposal_id = ?1)
         ORDER BY id DESC LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![proposal_id, limit], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                action: row.get(1)?,
                proposal_id: row.get(2)?,
                actor_id: row.get(3)?,
                commit_id: row.get(4)?,
                details: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn count_audit(conn: &Connection) -> Result<i64, DatabaseError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Database convenience methods
// ---------------------------------------------------------------------------

impl Database {
    pub fn insert_user(
        &self,
        username: &str,
        display_name: &str,
        email: &str,
    ) -> Result<User, DatabaseError> {
        insert_user(&self.conn(), username, display_name, email)
    }

    pub fn get_user(&self, id: DbId) -> Result<User, DatabaseError> {
        get_user(&self.conn(), id)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        find_user_by_username(&self.conn(), username)
    }

    pub fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        list_users(&self.conn())
    }

    pub fn get_proposal(&self, id: DbId) -> Result<Proposal, DatabaseError> {
        get_proposal(&self.conn(), id)
    }

    pub fn list_proposals(&self) -> Result<Vec<Proposal>, DatabaseError> {
        list_proposals(&self.conn())
    }

    pub fn get_contributor(&self, id: DbId) -> Result<Contributor, DatabaseError> {
        get_contributor(&self.conn(), id)
    }

    pub fn list_contributors(&self, proposal_id: DbId) -> Result<Vec<Contributor>, DatabaseError> {
        list_contributors(&self.conn(), proposal_id)
    }

    pub fn get_pull_request(&self, id: DbId) -> Result<PullRequest, DatabaseError> {
        get_pull_request(&self.conn(), id)
    }

    pub fn list_pull_requests(
        &self,
        proposal_id: DbId,
        status: Option<PullRequestStatus>,
    ) -> Result<Vec<PullRequest>, DatabaseError> {
        list_pull_requests(&self.conn(), proposal_id, status)
    }

    pub fn list_audit(
        &self,
        proposal_id: Option<DbId>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        list_audit(&self.conn(), proposal_id, limit)
    }

    pub fn count_audit(&self) -> Result<i64, DatabaseError> {
        count_audit(&self.conn())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Read a text column and map it into a typed value.
fn parse_column<T>(
    row: &Row<'_>,
    idx: usize,
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(DatabaseError::InvalidColumn {
                column: column.to_string(),
                value,
            }),
        )
    })
}
