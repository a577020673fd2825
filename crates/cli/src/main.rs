//! Draftline command-line tool.
//!
//! Provides subcommands for managing users and proposals, editing through
//! contributor branches, merging pull requests, publishing and reverting
//! versions, viewing history and the audit log, and generating /
//! validating configuration files.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use draftline_core::config::AppConfig;
use draftline_core::errors::VersioningError;
use draftline_core::models::{ContributorRole, Field, PullRequestStatus, User};
use draftline_core::release::RevertOutcome;
use draftline_core::service::{ProposalService, DEFAULT_HISTORY_LIMIT};
use draftline_core::store::BranchName;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Draftline command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "draftline",
    version,
    about = "Branch, merge, publish and revert collaborative proposals"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply if it is missing.
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/draftline/config.toml"
    )]
    config: String,

    /// Username of the acting user.
    #[arg(short = 'u', long = "as", global = true)]
    acting_user: Option<String>,

    /// Override the configured log level (RUST_LOG wins over both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./draftline.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Manage users.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Create and inspect proposals.
    Proposal {
        #[command(subcommand)]
        action: ProposalAction,
    },

    /// Manage contributors of a proposal.
    Contributor {
        #[command(subcommand)]
        action: ContributorAction,
    },

    /// Edit a proposal field.
    Edit {
        /// Field to change.
        field: FieldArg,

        /// Proposal ID.
        proposal: i64,

        /// New value.
        value: String,

        /// Contributor ID whose branch receives the edit. Without it the
        /// owner edits the working branch directly.
        #[arg(long)]
        contributor: Option<i64>,

        /// Commit message.
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Open, accept and list pull requests.
    Merge {
        #[command(subcommand)]
        action: MergeAction,
    },

    /// Publish the working branch as the next version.
    Publish {
        /// Proposal ID.
        proposal: i64,
    },

    /// Revert to the previous published version.
    Revert {
        /// Proposal ID.
        proposal: i64,
    },

    /// Show recent audit log entries.
    Audit {
        /// Only entries for this proposal.
        #[arg(short, long)]
        proposal: Option<i64>,

        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Register a user.
    Add {
        username: String,

        /// Email address used as the commit author email.
        #[arg(long)]
        email: String,

        /// Display name used as the commit author name.
        #[arg(long, default_value = "")]
        name: String,
    },
    /// List registered users.
    List,
}

#[derive(Subcommand, Debug)]
enum ProposalAction {
    /// Create a draft proposal owned by the acting user.
    Create {
        #[arg(long)]
        title: String,

        /// Body text.
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,

        /// Read the body text from a file.
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
    /// List all proposals.
    List,
    /// Show a proposal and its branches.
    Show {
        /// Proposal ID.
        id: i64,
    },
    /// Show the commit history of a branch.
    Log {
        /// Proposal ID.
        id: i64,

        /// Branch: `main`, `proposal/<id>` or `proposal/<id>/contributor/<cid>`.
        /// Defaults to the working branch.
        #[arg(short, long)]
        branch: Option<String>,

        /// Number of commits.
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// List published versions still tagged.
    Versions {
        /// Proposal ID.
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ContributorAction {
    /// Invite a user to contribute.
    Add {
        /// Proposal ID.
        proposal: i64,

        /// Username of the contributor.
        username: String,

        #[arg(long, value_enum, default_value = "editor")]
        role: RoleArg,
    },
    /// List contributors of a proposal.
    List {
        /// Proposal ID.
        proposal: i64,
    },
    /// Stop a contributor from editing.
    Suspend {
        proposal: i64,
        contributor: i64,
    },
    /// Allow a suspended contributor to edit again.
    Reactivate {
        proposal: i64,
        contributor: i64,
    },
    /// Merge the working branch into a contributor branch.
    Sync {
        proposal: i64,
        contributor: i64,
    },
}

#[derive(Subcommand, Debug)]
enum MergeAction {
    /// Ask the owner to merge a contributor branch.
    Request {
        proposal: i64,
        contributor: i64,

        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Merge an open pull request into the working branch.
    Accept {
        proposal: i64,

        /// Pull request ID.
        pull_request: i64,

        /// Merge commit message.
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List pull requests of a proposal.
    List {
        proposal: i64,

        /// Only open pull requests.
        #[arg(long)]
        open: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FieldArg {
    Title,
    Content,
}

impl From<FieldArg> for Field {
    fn from(arg: FieldArg) -> Self {
        match arg {
            FieldArg::Title => Field::Title,
            FieldArg::Content => Field::Content,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Editor,
    Reviewer,
}

impl From<RoleArg> for ContributorRole {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Editor => ContributorRole::Editor,
            RoleArg::Reviewer => ContributorRole::Reviewer,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = PathBuf::from(expand_tilde(&cli.config));
    match &cli.command {
        Commands::Init { output } => {
            init_logging(&AppConfig::default(), cli.log_level.as_deref());
            return cmd_init(output);
        }
        Commands::Validate => {
            init_logging(&AppConfig::default(), cli.log_level.as_deref());
            return cmd_validate(&config_path);
        }
        _ => {}
    }

    let config = load_config(&config_path)?;
    init_logging(&config, cli.log_level.as_deref());
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "no configuration file, using defaults");
    }
    let service =
        ProposalService::from_config(&config).context("failed to open the data directory")?;
    let ctx = Session {
        service: &service,
        acting_user: cli.acting_user.as_deref(),
    };

    let result = match cli.command {
        Commands::User { action } => cmd_user(&ctx, action),
        Commands::Proposal { action } => cmd_proposal(&ctx, action).await,
        Commands::Contributor { action } => cmd_contributor(&ctx, action).await,
        Commands::Edit {
            field,
            proposal,
            value,
            contributor,
            message,
        } => cmd_edit(&ctx, field.into(), proposal, &value, contributor, &message).await,
        Commands::Merge { action } => cmd_merge(&ctx, action).await,
        Commands::Publish { proposal } => cmd_publish(&ctx, proposal).await,
        Commands::Revert { proposal } => cmd_revert(&ctx, proposal).await,
        Commands::Audit { proposal, limit } => cmd_audit(&ctx, proposal, limit),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    };

    // Let collaborator deliveries finish before the runtime shuts down.
    service.flush_notifications().await;
    result
}

/// Per-invocation state shared by subcommands.
struct Session<'a> {
    service: &'a ProposalService,
    acting_user: Option<&'a str>,
}

impl Session<'_> {
    /// The user named by `--as`.
    fn actor(&self) -> Result<User> {
        let username = self
            .acting_user
            .context("this command needs an acting user; pass --as <username>")?;
        self.service
            .find_user_by_username(username)?
            .with_context(|| format!("no user named '{username}'"))
    }
}

// ---------------------------------------------------------------------------
// Config & logging helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    AppConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn init_logging(config: &AppConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(config.logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# Draftline Configuration
# See documentation for all available options.

[storage]
data_dir = ".draftline"

[logging]
level = "info"
json = false

[notifications]
# search_index_url = "http://localhost:9200"
search_index_name = "proposals"
# analysis_url = "https://analysis.example.org/v1/score"
# analysis_token_env = "DRAFTLINE_ANALYSIS_TOKEN"
max_attempts = 3
retry_backoff_ms = 500
timeout_secs = 10
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point [storage] data_dir at a durable directory");
    println!("  2. Configure the search index and analysis endpoints, if any");
    println!(
        "  3. Validate with: draftline validate --config {}",
        output.display()
    );
    println!(
        "  4. Register yourself: draftline --config {} user add <username> --email <email>",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {e}");
            anyhow::bail!("configuration validation failed");
        }
    }

    let n = &config.notifications;
    println!();
    println!("Configuration summary:");
    println!("  Data directory : {}", config.storage.data_dir.display());
    println!("  Log level      : {}", config.logging.level);
    println!(
        "  Search index   : {}",
        n.search_index_url
            .as_deref()
            .map(|url| format!("{url} ({})", n.search_index_name))
            .unwrap_or_else(|| "not configured".into())
    );
    println!(
        "  Analysis       : {}",
        n.analysis_url.as_deref().unwrap_or("not configured")
    );
    if n.analysis_token_env.is_some() {
        println!(
            "  Analysis token : {}",
            if n.analysis_token.is_some() {
                "set"
            } else {
                "NOT SET"
            }
        );
    }
    println!(
        "  Retries        : {} attempts, {}ms backoff",
        n.max_attempts, n.retry_backoff_ms
    );
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}

fn cmd_user(ctx: &Session<'_>, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add {
            username,
            email,
            name,
        } => {
            let user = ctx.service.register_user(&username, &name, &email)?;
            println!(
                "{}",
                style::success(&format!("Registered {} (id {})", user.username, user.id))
            );
        }
        UserAction::List => {
            let users = ctx.service.db().list_users()?;
            if users.is_empty() {
                println!("No users registered.");
                return Ok(());
            }
            let mut table = new_table(vec!["ID", "Username", "Name", "Email"]);
            for u in &users {
                table.add_row(vec![
                    Cell::new(u.id),
                    Cell::new(&u.username),
                    Cell::new(&u.display_name),
                    Cell::new(&u.email),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

async fn cmd_proposal(ctx: &Session<'_>, action: ProposalAction) -> Result<()> {
    let service = ctx.service;
    match action {
        ProposalAction::Create {
            title,
            content,
            content_file,
        } => {
            let owner = ctx.actor()?;
            let content = match (content, content_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => String::new(),
            };
            let proposal = service.create_proposal(owner.id, &title, &content).await?;
            println!(
                "{}",
                style::success(&format!(
                    "Created proposal {} on {} ({})",
                    proposal.id,
                    proposal.working_branch,
                    short(&proposal.last_commit_id)
                ))
            );
        }

        ProposalAction::List => {
            let proposals = service.list_proposals()?;
            if proposals.is_empty() {
                println!("No proposals found.");
                return Ok(());
            }
            let mut table = new_table(vec!["ID", "Title", "Version", "Status", "Owner"]);
            for p in &proposals {
                table.add_row(vec![
                    Cell::new(p.id),
                    Cell::new(truncate(&p.title, 48)),
                    Cell::new(p.version),
                    Cell::new(style::proposal_status(p.status)),
                    Cell::new(p.owner_id),
                ]);
            }
            println!("{table}");
        }

        ProposalAction::Show { id } => {
            let p = service.get_proposal(id)?;
            let owner = service.get_user(p.owner_id)?;
            println!();
            println!("{}", style::header(&format!("Proposal {}: {}", p.id, p.title)));
            println!();
            println!("  Owner          : {} ({})", owner.display_name, owner.username);
            println!("  Status         : {}", style::proposal_status(p.status));
            println!("  Version        : {}", p.version);
            println!("  Working branch : {}", p.working_branch);
            println!("  Head commit    : {}", p.last_commit_id);
            println!(
                "  Published at   : {}",
                p.published_commit_id.as_deref().unwrap_or("-")
            );
            println!("  Updated        : {}", p.updated_at.format("%Y-%m-%d %H:%M:%S"));

            println!();
            println!("  {}", style::header("Branches"));
            for (branch, head) in service.list_branches(id)? {
                println!("    {:<40} {}", branch.to_string(), style::dim(head.short()));
            }

            println!();
            println!("{}", style::dim(&"-".repeat(40)));
            println!("{}", p.content);
            println!();
        }

        ProposalAction::Log { id, branch, limit } => {
            let branch = match branch {
                Some(name) => BranchName::parse(&name)?,
                None => BranchName::working(id),
            };
            let commits = service.history(id, &branch, limit)?;
            println!();
            println!("{}", style::header(&format!("History of {branch}")));
            println!();
            for c in &commits {
                let marker = if c.is_merge() { "◆" } else { "●" };
                println!(
                    "  {} {}  {}  {}",
                    marker,
                    style::dim(c.id.short()),
                    c.timestamp.format("%Y-%m-%d %H:%M"),
                    c.message
                );
                println!("      {}", style::dim(&c.author.to_string()));
            }
            println!();
        }

        ProposalAction::Versions { id } => {
            let versions = service.list_versions(id)?;
            if versions.is_empty() {
                println!("Proposal {id} has no published versions.");
                return Ok(());
            }
            let mut table = new_table(vec!["Version", "Tag", "Commit"]);
            for (version, commit) in &versions {
                table.add_row(vec![
                    Cell::new(version),
                    Cell::new(format!("{id}-{version}")),
                    Cell::new(commit.short()),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

async fn cmd_contributor(ctx: &Session<'_>, action: ContributorAction) -> Result<()> {
    let service = ctx.service;
    match action {
        ContributorAction::Add {
            proposal,
            username,
            role,
        } => {
            let owner = ctx.actor()?;
            let user = service
                .find_user_by_username(&username)?
                .with_context(|| format!("no user named '{username}'"))?;
            let c = service
                .add_contributor(proposal, owner.id, user.id, role.into())
                .await?;
            println!(
                "{}",
                style::success(&format!(
                    "Added {username} as contributor {} on {}",
                    c.id, c.branch
                ))
            );
        }

        ContributorAction::List { proposal } => {
            let contributors = service.list_contributors(proposal)?;
            if contributors.is_empty() {
                println!("No contributors on proposal {proposal}.");
                return Ok(());
            }
            let mut table = new_table(vec!["ID", "User", "Role", "Branch", "Status"]);
            for c in &contributors {
                let user = service.get_user(c.user_id)?;
                table.add_row(vec![
                    Cell::new(c.id),
                    Cell::new(&user.username),
                    Cell::new(c.role),
                    Cell::new(&c.branch),
                    style::contributor_status_cell(c.status),
                ]);
            }
            println!("{table}");
        }

        ContributorAction::Suspend {
            proposal,
            contributor,
        } => {
            let owner = ctx.actor()?;
            service
                .suspend_contributor(proposal, owner.id, contributor)
                .await?;
            println!(
                "{}",
                style::success(&format!("Contributor {contributor} suspended"))
            );
        }

        ContributorAction::Reactivate {
            proposal,
            contributor,
        } => {
            let owner = ctx.actor()?;
            service
                .reactivate_contributor(proposal, owner.id, contributor)
                .await?;
            println!(
                "{}",
                style::success(&format!("Contributor {contributor} reactivated"))
            );
        }

        ContributorAction::Sync {
            proposal,
            contributor,
        } => {
            let caller = ctx.actor()?;
            let outcome = report_conflict(
                service
                    .sync_contributor(proposal, contributor, caller.id)
                    .await,
            )?;
            println!(
                "{}",
                style::success(&format!(
                    "Synced contributor {contributor}: {} at {}",
                    outcome.kind,
                    outcome.head.short()
                ))
            );
        }
    }
    Ok(())
}

async fn cmd_edit(
    ctx: &Session<'_>,
    field: Field,
    proposal: i64,
    value: &str,
    contributor: Option<i64>,
    message: &str,
) -> Result<()> {
    let caller = ctx.actor()?;
    let service = ctx.service;
    let commit = match (contributor, field) {
        (Some(cid), Field::Title) => {
            service
                .edit_title(proposal, cid, caller.id, value, message)
                .await?
        }
        (Some(cid), Field::Content) => {
            service
                .edit_content(proposal, cid, caller.id, value, message)
                .await?
        }
        (None, field) => {
            service
                .edit_working(proposal, caller.id, field, value, message)
                .await?
        }
    };
    println!(
        "{}",
        style::success(&format!("Committed {} ({})", commit.id.short(), commit.message))
    );
    Ok(())
}

async fn cmd_merge(ctx: &Session<'_>, action: MergeAction) -> Result<()> {
    let service = ctx.service;
    match action {
        MergeAction::Request {
            proposal,
            contributor,
            description,
        } => {
            let caller = ctx.actor()?;
            let pr = service
                .request_merge(proposal, contributor, caller.id, &description)
                .await?;
            println!(
                "{}",
                style::success(&format!(
                    "Opened pull request {}: {} -> {}",
                    pr.id, pr.source_branch, pr.target_branch
                ))
            );
        }

        MergeAction::Accept {
            proposal,
            pull_request,
            message,
        } => {
            let owner = ctx.actor()?;
            let outcome = report_conflict(
                service
                    .accept_merge(proposal, owner.id, pull_request, message.as_deref())
                    .await,
            )?;
            println!(
                "{}",
                style::success(&format!(
                    "Merged pull request {pull_request}: {} at {}",
                    outcome.kind,
                    outcome.head.short()
                ))
            );
        }

        MergeAction::List { proposal, open } => {
            let status = open.then_some(PullRequestStatus::Open);
            let prs = service.list_pull_requests(proposal, status)?;
            if prs.is_empty() {
                println!("No pull requests found.");
                return Ok(());
            }
            let mut table = new_table(vec!["ID", "Source", "Description", "Status", "Merge commit"]);
            for pr in &prs {
                table.add_row(vec![
                    Cell::new(pr.id),
                    Cell::new(&pr.source_branch),
                    Cell::new(truncate(&pr.description, 40)),
                    style::pull_request_status_cell(pr.status),
                    Cell::new(pr.merge_commit_id.as_deref().map(short).unwrap_or("-")),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

async fn cmd_publish(ctx: &Session<'_>, proposal: i64) -> Result<()> {
    let owner = ctx.actor()?;
    let outcome = ctx.service.publish(proposal, owner.id).await?;
    println!(
        "{}",
        style::success(&format!(
            "Published {} as {} ({}, {})",
            proposal,
            outcome.version,
            outcome.tag,
            outcome.commit_id.short()
        ))
    );
    Ok(())
}

async fn cmd_revert(ctx: &Session<'_>, proposal: i64) -> Result<()> {
    let owner = ctx.actor()?;
    let outcome = ctx.service.revert(proposal, owner.id).await?;
    match &outcome {
        RevertOutcome::Restored {
            version, commit_id, ..
        } => println!(
            "{}",
            style::success(&format!(
                "Reverted {proposal} to {version} ({})",
                commit_id.short()
            ))
        ),
        RevertOutcome::BackToDraft { abandoned_tag, .. } => {
            let withdrawn = abandoned_tag
                .as_ref()
                .map(|t| format!(", removed {t}"))
                .unwrap_or_default();
            println!(
                "{}",
                style::warn(&format!(
                    "No earlier version: proposal {proposal} is {} again{withdrawn}",
                    outcome.status()
                ))
            );
        }
    }
    Ok(())
}

fn cmd_audit(ctx: &Session<'_>, proposal: Option<i64>, limit: u32) -> Result<()> {
    let entries = ctx
        .service
        .audit_log(proposal, limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!("{:<20} {:<28} {:<9} DETAILS", "TIMESTAMP", "ACTION", "PROPOSAL");
    println!("{}", "-".repeat(90));

    for entry in &entries {
        println!(
            "{:<20} {:<28} {:<9} {}",
            &entry.created_at[..19.min(entry.created_at.len())],
            entry.action,
            entry
                .proposal_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            truncate(entry.details.as_deref().unwrap_or(""), 40),
        );
    }

    println!();
    println!("{} entries shown", entries.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// Print the field diffs of a merge conflict before failing.
fn report_conflict<T>(result: Result<T, VersioningError>) -> Result<T> {
    if let Err(VersioningError::MergeConflict { fields }) = &result {
        for conflict in fields {
            println!("{}", conflict.render_diff());
        }
        println!(
            "{}",
            style::warn("Sync the contributor branch, resolve the fields and request again.")
        );
    }
    Ok(result?)
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
