use clap::{Parser, Subcommand};
use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use issuedeck::backend::{Row, SqliteBackend};
use issuedeck::config::Config;
use issuedeck::tracker::{
  IssueFilter, IssuePatch, IssueStatus, NewIssue, Priority, Role, TrackerClient,
};
use issuedeck::{commands, logging};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "issuedeck")]
#[command(about = "Report, track and resolve workplace issues")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/issuedeck/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as this user id (overrides config and ISSUEDECK_USER)
  #[arg(short, long)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List issues, newest first
  #[command(visible_alias = "ls")]
  List {
    /// Case-insensitive text to find in title or description
    #[arg(short, long)]
    search: Option<String>,
    #[arg(long)]
    status: Option<IssueStatus>,
    #[arg(long)]
    priority: Option<Priority>,
  },
  /// Show an issue with comments, attachments and activity
  Show { id: String },
  /// Report a new issue
  #[command(visible_alias = "new")]
  Create {
    title: String,
    #[arg(short, long, default_value = "")]
    description: String,
    #[arg(long, default_value = "medium")]
    priority: Priority,
    #[arg(long, default_value = "open")]
    status: IssueStatus,
    #[arg(long)]
    component: Option<String>,
    #[arg(long)]
    department: Option<String>,
  },
  /// Change fields of an issue or add a progress note
  Update {
    id: String,
    #[arg(long)]
    status: Option<IssueStatus>,
    #[arg(long)]
    priority: Option<Priority>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    assign: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    /// Append a progress note instead of patching fields
    #[arg(long)]
    note: Option<String>,
  },
  /// Delete an issue
  #[command(visible_alias = "rm")]
  Delete { id: String },
  /// Comment on an issue
  Comment { id: String, text: String },
  /// Attach a file to an issue, or download one with --download
  Attach {
    id: String,
    file: PathBuf,
    /// Download the stored object at FILE's path into the current directory
    #[arg(long)]
    download: bool,
  },
  /// Issue counts by status, priority and department
  Analytics,
  /// List users and their roles
  Users,
  /// Change a user's role
  Role { user_id: String, role: Role },
  /// Load collections from a JSON file: {"issues": [...], "profiles": [...]}
  Seed { file: PathBuf },
  /// Show the commands available to the current user
  Commands {
    #[arg(default_value = "")]
    filter: String,
  },
}

impl Command {
  fn name(&self) -> &'static str {
    match self {
      Command::List { .. } => "list",
      Command::Show { .. } => "show",
      Command::Create { .. } => "create",
      Command::Update { .. } => "update",
      Command::Delete { .. } => "delete",
      Command::Comment { .. } => "comment",
      Command::Attach { .. } => "attach",
      Command::Analytics => "analytics",
      Command::Users => "users",
      Command::Role { .. } => "role",
      Command::Seed { .. } => "seed",
      Command::Commands { .. } => "commands",
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(user) = args.user {
    config.user = Some(user);
  }

  let _log_guard = match logging::log_dir() {
    Some(dir) => Some(logging::init(&dir, config.log_level.as_deref())?),
    None => None,
  };

  let db_path = config.backend_path()?;
  if let Some(parent) = db_path.parent() {
    std::fs::create_dir_all(parent)
      .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
  }
  let backend = SqliteBackend::open(&db_path, config.user.clone())
    .wrap_err_with(|| format!("Failed to open {}", db_path.display()))?;
  info!(path = %db_path.display(), user = ?config.user, "opened backend");

  if let Command::Seed { file } = &args.command {
    return seed(&backend, file);
  }

  let tracker = TrackerClient::new(Arc::new(backend)).reconcile_on_error(config.cache.reconcile_on_error);
  let role = match &config.user {
    Some(_) => tracker.current_role().await?,
    None => Role::default(),
  };

  if let Some(cmd) = commands::find(args.command.name()) {
    if !cmd.allowed_for(role) {
      return Err(eyre!("'{}' is not available to a {}", cmd.name, role));
    }
  }

  run(&tracker, role, args.command).await
}

async fn run(tracker: &TrackerClient, role: Role, command: Command) -> Result<()> {
  match command {
    Command::List {
      search,
      status,
      priority,
    } => {
      let issues = tracker.issues().await?;
      let filter = IssueFilter {
        search: search.filter(|s| !s.trim().is_empty()),
        status,
        priority,
      };
      for issue in filter.apply(&issues) {
        println!(
          "{:>6}  {:<12} {:<9} {}",
          issue.id,
          issue.status.to_string(),
          issue.priority.to_string(),
          issue.title
        );
      }
    }
    Command::Show { id } => {
      let issue = tracker.issue(&id).await?;
      println!("#{} {}", issue.id, issue.title);
      println!("status: {}  priority: {}", issue.status, issue.priority);
      if let Some(reporter) = &issue.reporter {
        println!("reported by: {}", reporter.full_name);
      }
      if let Some(department) = &issue.responsible_department {
        println!("department: {}", department);
      }
      if !issue.description.is_empty() {
        println!("\n{}", issue.description);
      }
      for update in &issue.issue_updates {
        let by = update.updated_by_name.as_deref().unwrap_or(&update.updated_by);
        println!("  [{}] {}: {}", update.update_date, by, update.update_text);
      }

      let comments = tracker.comments(&id).await?;
      if !comments.is_empty() {
        println!("\ncomments:");
        for comment in comments.iter() {
          let author = comment
            .author
            .as_ref()
            .map(|a| a.full_name.as_str())
            .unwrap_or(&comment.user_id);
          println!("  {} ({}): {}", author, comment.created_at, comment.content);
        }
      }

      let attachments = tracker.attachments(&id).await?;
      if !attachments.is_empty() {
        println!("\nattachments:");
        for attachment in attachments.iter() {
          println!(
            "  {} ({} bytes) {}",
            attachment.file_name, attachment.file_size, attachment.file_path
          );
        }
      }

      let activity = tracker.activity_logs(&id).await?;
      if !activity.is_empty() {
        println!("\nactivity:");
        for log in activity.iter() {
          let actor = log.actor.as_ref().map(|a| a.full_name.as_str()).unwrap_or(&log.user_id);
          println!("  {} {} {}", log.created_at, actor, log.action);
        }
      }
    }
    Command::Create {
      title,
      description,
      priority,
      status,
      component,
      department,
    } => {
      let new = NewIssue {
        priority,
        status,
        component,
        responsible_department: department,
        ..NewIssue::new(title, description)
      };
      let issue = tracker.create_issue(new).await?;
      println!("created issue {}", issue.id);
    }
    Command::Update {
      id,
      status,
      priority,
      title,
      department,
      assign,
      resolution,
      note,
    } => {
      if let Some(note) = note {
        tracker.add_issue_update(&id, &note).await?;
      }
      let patch = IssuePatch {
        status,
        priority,
        title,
        responsible_department: department,
        assigned_to: assign,
        resolution_steps: resolution,
        ..IssuePatch::default()
      };
      if !patch.is_empty() {
        let issue = tracker.update_issue(&id, patch).await?;
        println!("issue {} is {}", issue.id, issue.status);
      }
    }
    Command::Delete { id } => {
      tracker.delete_issue(&id).await?;
      println!("deleted issue {}", id);
    }
    Command::Comment { id, text } => {
      tracker.add_comment(&id, &text).await?;
      println!("comment added to issue {}", id);
    }
    Command::Attach { id, file, download } => {
      if download {
        let path = file.to_string_lossy();
        let bytes = tracker.download_attachment(&path).await?;
        let name = file
          .file_name()
          .ok_or_else(|| eyre!("Not a file path: {}", file.display()))?;
        std::fs::write(name, bytes).wrap_err("Failed to write download")?;
        println!("downloaded {}", path);
      } else {
        let bytes = std::fs::read(&file)
          .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
        let name = file
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .ok_or_else(|| eyre!("Not a file path: {}", file.display()))?;
        let attachment = tracker.upload_attachment(&id, &name, bytes).await?;
        println!("stored {}", attachment.file_path);
      }
    }
    Command::Analytics => {
      let analytics = tracker.analytics().await?;
      println!("{} issues, {} open", analytics.total, analytics.open_count());
      println!("\nby status:");
      for (status, count) in &analytics.by_status {
        println!("  {:<12} {}", status.to_string(), count);
      }
      println!("\nby priority:");
      for (priority, count) in &analytics.by_priority {
        println!("  {:<12} {}", priority.to_string(), count);
      }
      if !analytics.by_department.is_empty() {
        println!("\nby department:");
        for (department, count) in &analytics.by_department {
          println!("  {:<24} {}", department, count);
        }
      }
      if !analytics.trend.is_empty() {
        println!("\ndaily trend (opened / resolved):");
        for (day, trend) in &analytics.trend {
          println!("  {}  {:>3} / {:<3}", day, trend.opened, trend.resolved);
        }
      }
    }
    Command::Users => {
      for user in tracker.users().await?.iter() {
        println!("{:<12} {:<12} {}", user.id, user.role.to_string(), user.full_name);
      }
    }
    Command::Role { user_id, role } => {
      tracker.set_user_role(&user_id, role).await?;
      println!("{} is now {}", user_id, role);
    }
    Command::Commands { filter } => {
      for cmd in commands::get_suggestions(&filter, role) {
        println!("{:<10} {}", cmd.name, cmd.description);
      }
    }
    Command::Seed { .. } => return Err(eyre!("seed must run before the tracker is opened")),
  }
  Ok(())
}

fn seed(backend: &SqliteBackend, file: &Path) -> Result<()> {
  let contents = std::fs::read_to_string(file)
    .wrap_err_with(|| format!("Failed to read seed file {}", file.display()))?;
  let collections: BTreeMap<String, Vec<Row>> = serde_json::from_str(&contents)
    .wrap_err_with(|| format!("Failed to parse seed file {}", file.display()))?;
  for (collection, rows) in &collections {
    backend.seed(collection, rows)?;
    println!("seeded {} rows into {}", rows.len(), collection);
  }
  Ok(())
}
