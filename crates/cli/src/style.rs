//! Shared styling utilities for CLI output.

use comfy_table::{Cell, Color};
use console::Style;

use draftline_core::models::{ContributorStatus, ProposalStatus, PullRequestStatus};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Proposal status label: published (green) or draft (yellow).
pub fn proposal_status(status: ProposalStatus) -> String {
    let style = match status {
        ProposalStatus::Published => Style::new().green().bold(),
        ProposalStatus::Draft => Style::new().yellow(),
    };
    style.apply_to(status.as_str()).to_string()
}

pub fn contributor_status_cell(status: ContributorStatus) -> Cell {
    match status {
        ContributorStatus::Active => Cell::new("● active").fg(Color::Green),
        ContributorStatus::Suspended => Cell::new("○ suspended").fg(Color::DarkGrey),
    }
}

pub fn pull_request_status_cell(status: PullRequestStatus) -> Cell {
    match status {
        PullRequestStatus::Open => Cell::new("⧗ open").fg(Color::Yellow),
        PullRequestStatus::Merged => Cell::new("✓ merged").fg(Color::Green),
    }
}
