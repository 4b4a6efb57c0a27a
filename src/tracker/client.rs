//! `TrackerClient`: tracker reads and optimistic writes through the cache.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{row_id, Backend, RowQuery, UserId};
use crate::cache::{
  loader, CacheError, Loader, MutationDescriptor, OptimisticTarget, QueryClient, Result,
};

use super::analytics::Analytics;
use super::keys::TrackerQueryKey;
use super::rows::{from_row, from_rows, str_field, to_row};
use super::types::{
  ActivityLog, Attachment, Comment, Issue, IssuePatch, IssueStatus, IssueUpdate, NewIssue,
  ProfileRef, Role, UserProfile,
};

pub const ISSUES: &str = "issues";
pub const COMMENTS: &str = "comments";
pub const ATTACHMENTS: &str = "attachments";
pub const ACTIVITY_LOGS: &str = "activity_logs";
pub const PROFILES: &str = "profiles";
pub const USER_ROLES: &str = "user_roles";
pub const ATTACHMENT_BUCKET: &str = "issue-attachments";

/// Largest accepted attachment (10 MiB).
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// Issue tracker API backed by a [`QueryClient`].
///
/// Reads go through the cache and are shared between callers. Writes are
/// applied to the cached views first and rolled back if the backend rejects
/// them.
#[derive(Clone)]
pub struct TrackerClient {
  backend: Arc<dyn Backend>,
  cache: QueryClient,
  reconcile_on_error: bool,
  /// Held across the read and write of an issue's note list.
  note_writes: Arc<Mutex<()>>,
}

impl TrackerClient {
  pub fn new(backend: Arc<dyn Backend>) -> Self {
    Self::with_cache(backend, QueryClient::new())
  }

  pub fn with_cache(backend: Arc<dyn Backend>, cache: QueryClient) -> Self {
    Self {
      backend,
      cache,
      reconcile_on_error: false,
      note_writes: Arc::new(Mutex::new(())),
    }
  }

  /// Refresh the affected views after a failed write as well.
  pub fn reconcile_on_error(mut self, enabled: bool) -> Self {
    self.reconcile_on_error = enabled;
    self
  }

  pub fn cache(&self) -> &QueryClient {
    &self.cache
  }

  pub fn backend(&self) -> &Arc<dyn Backend> {
    &self.backend
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Loader for a tracker key, as registered with the fetch coordinator.
  pub fn loader_for(&self, key: &TrackerQueryKey) -> Loader {
    let backend = Arc::clone(&self.backend);
    match key.clone() {
      TrackerQueryKey::Issues => loader(move || fetch_issues(Arc::clone(&backend))),
      TrackerQueryKey::Issue { id } => {
        loader(move || fetch_issue(Arc::clone(&backend), id.clone()))
      }
      TrackerQueryKey::Comments { issue_id } => {
        loader(move || fetch_comments(Arc::clone(&backend), issue_id.clone()))
      }
      TrackerQueryKey::Attachments { issue_id } => {
        loader(move || fetch_attachments(Arc::clone(&backend), issue_id.clone()))
      }
      TrackerQueryKey::ActivityLogs { issue_id } => {
        loader(move || fetch_activity_logs(Arc::clone(&backend), issue_id.clone()))
      }
      TrackerQueryKey::Users => loader(move || fetch_users(Arc::clone(&backend))),
      TrackerQueryKey::CurrentRole => loader(move || fetch_current_role(Arc::clone(&backend))),
    }
  }

  async fn read<T: Send + Sync + 'static>(&self, key: TrackerQueryKey) -> Result<Arc<T>> {
    debug!(query = %key.description(), "read");
    let loader = self.loader_for(&key);
    self.cache.query::<T>(&key.query_key(), loader).await
  }

  /// All issues, newest first, with the reporter's profile.
  pub async fn issues(&self) -> Result<Arc<Vec<Issue>>> {
    self.read(TrackerQueryKey::Issues).await
  }

  pub async fn issue(&self, id: &str) -> Result<Arc<Issue>> {
    self.read(TrackerQueryKey::issue(id)).await
  }

  /// Comments on an issue, oldest first.
  pub async fn comments(&self, issue_id: &str) -> Result<Arc<Vec<Comment>>> {
    self.read(TrackerQueryKey::comments(issue_id)).await
  }

  pub async fn attachments(&self, issue_id: &str) -> Result<Arc<Vec<Attachment>>> {
    self.read(TrackerQueryKey::attachments(issue_id)).await
  }

  pub async fn activity_logs(&self, issue_id: &str) -> Result<Arc<Vec<ActivityLog>>> {
    self.read(TrackerQueryKey::activity_logs(issue_id)).await
  }

  /// Every profile with its role.
  pub async fn users(&self) -> Result<Arc<Vec<UserProfile>>> {
    self.read(TrackerQueryKey::Users).await
  }

  /// Role of the signed-in user. `Unauthorized` when nobody is signed in.
  pub async fn current_role(&self) -> Result<Role> {
    self.read::<Role>(TrackerQueryKey::CurrentRole).await.map(|role| *role)
  }

  /// Issue as currently cached, from its own entry or from the list.
  pub fn cached_issue(&self, id: &str) -> Option<Issue> {
    if let Some(issue) = self.cache.cached::<Issue>(&TrackerQueryKey::issue(id).query_key()) {
      return Some((*issue).clone());
    }
    self
      .cache
      .cached::<Vec<Issue>>(&TrackerQueryKey::Issues.query_key())?
      .iter()
      .find(|issue| issue.id == id)
      .cloned()
  }

  /// Summary counts over the issue list.
  pub async fn analytics(&self) -> Result<Analytics> {
    let issues = self.issues().await?;
    Ok(Analytics::from_issues(&issues))
  }

  async fn require_user(&self) -> Result<UserId> {
    self
      .backend
      .identity()
      .current_user()
      .await?
      .ok_or_else(|| CacheError::Unauthorized("not signed in".to_string()))
  }

  // ==========================================================================
  // Issues
  // ==========================================================================

  /// Create an issue reported by the signed-in user.
  ///
  /// The issue shows up at the top of the cached list under a `temp-` id
  /// until the list is refreshed.
  pub async fn create_issue(&self, new: NewIssue) -> Result<Issue> {
    let user = self.require_user().await?;
    let now = Utc::now();
    let placeholder = new.to_placeholder(
      format!("temp-{}", now.timestamp_millis()),
      &user,
      &now.to_rfc3339(),
    );

    let mut row = to_row(&new)?;
    row.insert("reported_by".into(), Value::String(user.clone()));

    let backend = Arc::clone(&self.backend);
    let descriptor = MutationDescriptor::new("create issue", move || async move {
      let created = backend.collection(ISSUES).insert(row).await?;
      let issue: Issue = from_row(created)?;
      record_activity(&*backend, &issue.id, &user, "created", json!({ "title": issue.title })).await;
      Ok(issue)
    })
    .target(OptimisticTarget::prepend_item(
      TrackerQueryKey::Issues.query_key(),
      placeholder,
    ))
    .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  /// Patch an issue in both the entity and list views.
  ///
  /// Moving an issue to resolved or closed stamps `resolved_at`; closing it
  /// also stamps `closing_date`.
  pub async fn update_issue(&self, id: &str, mut patch: IssuePatch) -> Result<Issue> {
    let entity_key = TrackerQueryKey::issue(id).query_key();
    patch.validate().map_err(|reason| CacheError::LocalApply {
      key: entity_key.clone(),
      reason,
    })?;

    let now = Utc::now().to_rfc3339();
    if let Some(status) = patch.status {
      let previous = self.cached_issue(id).map(|issue| issue.status);
      if previous != Some(status) {
        if status.is_done() && patch.resolved_at.is_none() {
          patch.resolved_at = Some(now.clone());
        }
        if status == IssueStatus::Closed && patch.closing_date.is_none() {
          patch.closing_date = Some(now.clone());
        }
      }
    }

    let row = to_row(&patch)?;
    let details = Value::Object(row.clone());
    let backend = Arc::clone(&self.backend);
    let issue_id = id.to_string();
    let commit = move || async move {
      let updated = backend.collection(ISSUES).update(&issue_id, row).await?;
      if let Some(actor) = backend.identity().current_user().await? {
        record_activity(&*backend, &issue_id, &actor, "updated", details).await;
      }
      from_row::<Issue>(updated)
    };

    let entity_patch = patch.clone();
    let entity_now = now.clone();
    let list_id = id.to_string();
    let descriptor = MutationDescriptor::new("update issue", commit)
      .target(OptimisticTarget::patch(entity_key, move |issue: &mut Issue| {
        entity_patch.apply_to(issue, &entity_now)
      }))
      .target(OptimisticTarget::patch_item(
        TrackerQueryKey::Issues.query_key(),
        move |issue: &Issue| issue.id == list_id,
        move |issue: &mut Issue| patch.apply_to(issue, &now),
      ))
      .invalidates(TrackerQueryKey::activity_logs(id).query_key())
      .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  /// Delete an issue. It disappears from the cached list immediately and
  /// comes back at the same position if the backend refuses.
  pub async fn delete_issue(&self, id: &str) -> Result<()> {
    let backend = Arc::clone(&self.backend);
    let issue_id = id.to_string();
    let list_id = id.to_string();
    let descriptor = MutationDescriptor::new("delete issue", move || async move {
      backend.collection(ISSUES).remove(&issue_id).await
    })
    .target(OptimisticTarget::remove_item(
      TrackerQueryKey::Issues.query_key(),
      move |issue: &Issue| issue.id == list_id,
    ))
    .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  /// Append a progress note to an issue, signed by the current user.
  ///
  /// The note is pushed onto whatever list the cache and the backend hold
  /// when it lands, so concurrent notes on one issue are all kept.
  pub async fn add_issue_update(&self, id: &str, text: &str) -> Result<Issue> {
    let entity_key = TrackerQueryKey::issue(id).query_key();
    let text = text.trim();
    if text.is_empty() {
      return Err(CacheError::LocalApply {
        key: entity_key,
        reason: "update text is empty".to_string(),
      });
    }
    let user = self.require_user().await?;
    let name = fetch_profiles(&*self.backend)
      .await?
      .remove(&user)
      .map(|profile| profile.full_name);
    let note = IssueUpdate {
      update_text: text.to_string(),
      update_date: Utc::now().to_rfc3339(),
      updated_by: user,
      updated_by_name: name,
    };

    let backend = Arc::clone(&self.backend);
    let note_writes = Arc::clone(&self.note_writes);
    let issue_id = id.to_string();
    let committed = note.clone();
    let commit = move || async move {
      let _writing = note_writes.lock().await;
      let issues = backend.collection(ISSUES);
      let query = RowQuery::new().eq("id", issue_id.as_str()).limit(1);
      let row = issues
        .read(&query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CacheError::NotFound(format!("issue {}", issue_id)))?;
      let mut updates = from_row::<Issue>(row)?.issue_updates;
      updates.push(committed.clone());
      let patch = IssuePatch {
        issue_updates: Some(updates),
        ..IssuePatch::default()
      };
      let updated = issues.update(&issue_id, to_row(&patch)?).await?;
      let details = json!({ "update_text": committed.update_text });
      record_activity(&*backend, &issue_id, &committed.updated_by, "updated", details).await;
      from_row::<Issue>(updated)
    };

    let entity_note = note.clone();
    let list_id = id.to_string();
    let descriptor = MutationDescriptor::new("add issue update", commit)
      .target(OptimisticTarget::patch(entity_key, move |issue: &mut Issue| {
        issue.issue_updates.push(entity_note);
        Ok(())
      }))
      .target(OptimisticTarget::patch_item(
        TrackerQueryKey::Issues.query_key(),
        move |issue: &Issue| issue.id == list_id,
        move |issue: &mut Issue| {
          issue.issue_updates.push(note.clone());
          Ok(())
        },
      ))
      .invalidates(TrackerQueryKey::activity_logs(id).query_key())
      .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  // ==========================================================================
  // Comments
  // ==========================================================================

  /// Add a comment. Blank comments are rejected before anything is sent.
  pub async fn add_comment(&self, issue_id: &str, content: &str) -> Result<Comment> {
    let key = TrackerQueryKey::comments(issue_id).query_key();
    let content = content.trim();
    if content.is_empty() {
      return Err(CacheError::LocalApply {
        key,
        reason: "comment is empty".to_string(),
      });
    }
    let user = self.require_user().await?;
    let now = Utc::now();
    let placeholder = Comment {
      id: format!("temp-{}", now.timestamp_millis()),
      issue_id: issue_id.to_string(),
      user_id: user.clone(),
      content: content.to_string(),
      created_at: now.to_rfc3339(),
      author: None,
    };

    let mut row = serde_json::Map::new();
    row.insert("issue_id".into(), json!(issue_id));
    row.insert("user_id".into(), json!(user));
    row.insert("content".into(), json!(content));

    let backend = Arc::clone(&self.backend);
    let descriptor = MutationDescriptor::new("add comment", move || async move {
      let created = backend.collection(COMMENTS).insert(row).await?;
      from_row::<Comment>(created)
    })
    .target(OptimisticTarget::append_item(key, placeholder))
    .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  // ==========================================================================
  // Attachments
  // ==========================================================================

  /// Upload a file and record it against an issue.
  ///
  /// The object is stored at `<issue>/<user>/<millis>.<ext>`.
  pub async fn upload_attachment(
    &self,
    issue_id: &str,
    file_name: &str,
    bytes: Vec<u8>,
  ) -> Result<Attachment> {
    let key = TrackerQueryKey::attachments(issue_id).query_key();
    if bytes.len() > MAX_ATTACHMENT_BYTES {
      return Err(CacheError::LocalApply {
        key,
        reason: format!("{} is larger than 10 MiB", file_name),
      });
    }
    let user = self.require_user().await?;
    let path = attachment_path(issue_id, &user, file_name, Utc::now().timestamp_millis());

    let mut row = serde_json::Map::new();
    row.insert("issue_id".into(), json!(issue_id));
    row.insert("file_name".into(), json!(file_name));
    row.insert("file_path".into(), json!(path));
    row.insert("file_size".into(), json!(bytes.len()));
    row.insert("uploaded_by".into(), json!(user));

    let backend = Arc::clone(&self.backend);
    let descriptor = MutationDescriptor::new("upload attachment", move || async move {
      let bucket = backend.bucket(ATTACHMENT_BUCKET);
      bucket.put(&path, bytes).await?;
      match backend.collection(ATTACHMENTS).insert(row).await {
        Ok(created) => from_row::<Attachment>(created),
        Err(err) => {
          if let Err(cleanup) = bucket.remove(&path).await {
            warn!(%path, error = %cleanup, "failed to remove orphaned upload");
          }
          Err(err)
        }
      }
    })
    .invalidates(key);

    self.cache.execute(descriptor).await
  }

  /// Remove the stored object, then its record.
  pub async fn delete_attachment(&self, attachment: &Attachment) -> Result<()> {
    let key = TrackerQueryKey::attachments(&attachment.issue_id).query_key();
    let backend = Arc::clone(&self.backend);
    let id = attachment.id.clone();
    let path = attachment.file_path.clone();
    let list_id = attachment.id.clone();
    let descriptor = MutationDescriptor::new("delete attachment", move || async move {
      backend.bucket(ATTACHMENT_BUCKET).remove(&path).await?;
      backend.collection(ATTACHMENTS).remove(&id).await
    })
    .target(OptimisticTarget::remove_item(key, move |a: &Attachment| a.id == list_id))
    .invalidate_on_error(self.reconcile_on_error);

    self.cache.execute(descriptor).await
  }

  pub async fn download_attachment(&self, path: &str) -> Result<Vec<u8>> {
    self.backend.bucket(ATTACHMENT_BUCKET).get(path).await
  }

  // ==========================================================================
  // Administration
  // ==========================================================================

  /// Replace a user's role. Only admins may do this.
  pub async fn set_user_role(&self, user_id: &str, role: Role) -> Result<()> {
    let actor = self.require_user().await?;
    let actor_role = self.current_role().await?;
    if actor_role != Role::Admin {
      return Err(CacheError::Unauthorized(format!(
        "{} cannot change roles",
        actor_role
      )));
    }

    let backend = Arc::clone(&self.backend);
    let target = user_id.to_string();
    let list_id = user_id.to_string();
    let mut descriptor = MutationDescriptor::new("set user role", move || async move {
      let roles = backend.collection(USER_ROLES);
      let existing = roles.read(&RowQuery::new().eq("user_id", target.as_str())).await?;
      for row in &existing {
        if let Some(id) = row_id(row) {
          roles.remove(&id).await?;
        }
      }
      let mut row = serde_json::Map::new();
      row.insert("user_id".into(), json!(target));
      row.insert("role".into(), json!(role));
      roles.insert(row).await?;
      Ok(())
    })
    .target(OptimisticTarget::patch_item(
      TrackerQueryKey::Users.query_key(),
      move |user: &UserProfile| user.id == list_id,
      move |user: &mut UserProfile| {
        user.role = role;
        Ok(())
      },
    ))
    .invalidate_on_error(self.reconcile_on_error);

    if actor == user_id {
      descriptor = descriptor.invalidates(TrackerQueryKey::CurrentRole.query_key());
    }
    self.cache.execute(descriptor).await
  }

  /// Forget everything cached for the signed-in user.
  pub fn sign_out(&self) {
    self.cache.clear();
  }
}

fn attachment_path(issue_id: &str, user: &str, file_name: &str, millis: i64) -> String {
  let ext = Path::new(file_name)
    .extension()
    .and_then(|ext| ext.to_str())
    .unwrap_or("bin");
  format!("{}/{}/{}.{}", issue_id, user, millis, ext)
}

async fn record_activity(
  backend: &dyn Backend,
  issue_id: &str,
  user: &str,
  action: &str,
  details: Value,
) {
  let mut row = serde_json::Map::new();
  row.insert("issue_id".into(), json!(issue_id));
  row.insert("user_id".into(), json!(user));
  row.insert("action".into(), json!(action));
  row.insert("details".into(), details);
  if let Err(err) = backend.collection(ACTIVITY_LOGS).insert(row).await {
    warn!(%issue_id, %action, error = %err, "failed to record activity");
  }
}

// ============================================================================
// Loaders
// ============================================================================

async fn fetch_profiles(backend: &dyn Backend) -> Result<HashMap<String, ProfileRef>> {
  let rows = backend.collection(PROFILES).read(&RowQuery::new()).await?;
  let mut profiles = HashMap::with_capacity(rows.len());
  for row in rows {
    if let Some(id) = row_id(&row) {
      profiles.insert(id, from_row::<ProfileRef>(row)?);
    }
  }
  Ok(profiles)
}

async fn fetch_issues(backend: Arc<dyn Backend>) -> Result<Vec<Issue>> {
  let query = RowQuery::new().order_by("created_at", false);
  let rows = backend.collection(ISSUES).read(&query).await?;
  let mut issues: Vec<Issue> = from_rows(rows)?;
  let profiles = fetch_profiles(&*backend).await?;
  for issue in &mut issues {
    issue.reporter = issue.reported_by.as_ref().and_then(|id| profiles.get(id)).cloned();
  }
  Ok(issues)
}

async fn fetch_issue(backend: Arc<dyn Backend>, id: String) -> Result<Issue> {
  let query = RowQuery::new().eq("id", id.as_str()).limit(1);
  let row = backend
    .collection(ISSUES)
    .read(&query)
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| CacheError::NotFound(format!("issue {}", id)))?;
  let mut issue: Issue = from_row(row)?;
  if let Some(reporter) = &issue.reported_by {
    issue.reporter = fetch_profiles(&*backend).await?.remove(reporter);
  }
  Ok(issue)
}

async fn fetch_comments(backend: Arc<dyn Backend>, issue_id: String) -> Result<Vec<Comment>> {
  let query = RowQuery::new()
    .eq("issue_id", issue_id.as_str())
    .order_by("created_at", true);
  let rows = backend.collection(COMMENTS).read(&query).await?;
  let mut comments: Vec<Comment> = from_rows(rows)?;
  let profiles = fetch_profiles(&*backend).await?;
  for comment in &mut comments {
    comment.author = profiles.get(&comment.user_id).cloned();
  }
  Ok(comments)
}

async fn fetch_attachments(backend: Arc<dyn Backend>, issue_id: String) -> Result<Vec<Attachment>> {
  let query = RowQuery::new()
    .eq("issue_id", issue_id.as_str())
    .order_by("created_at", false);
  from_rows(backend.collection(ATTACHMENTS).read(&query).await?)
}

async fn fetch_activity_logs(
  backend: Arc<dyn Backend>,
  issue_id: String,
) -> Result<Vec<ActivityLog>> {
  let query = RowQuery::new()
    .eq("issue_id", issue_id.as_str())
    .order_by("created_at", false);
  let rows = backend.collection(ACTIVITY_LOGS).read(&query).await?;
  let mut logs: Vec<ActivityLog> = from_rows(rows)?;
  let profiles = fetch_profiles(&*backend).await?;
  for log in &mut logs {
    log.actor = profiles.get(&log.user_id).cloned();
  }
  Ok(logs)
}

async fn fetch_users(backend: Arc<dyn Backend>) -> Result<Vec<UserProfile>> {
  let profiles = backend
    .collection(PROFILES)
    .read(&RowQuery::new().order_by("full_name", true))
    .await?;
  let roles: HashMap<String, Role> = backend
    .collection(USER_ROLES)
    .read(&RowQuery::new())
    .await?
    .iter()
    .filter_map(|row| {
      let user = str_field(row, "user_id")?;
      let role: Role = str_field(row, "role")?.parse().ok()?;
      Some((user.to_string(), role))
    })
    .collect();

  profiles
    .into_iter()
    .map(|row| {
      let mut user: UserProfile = from_row(row)?;
      user.role = roles.get(&user.id).copied().unwrap_or_default();
      Ok(user)
    })
    .collect()
}

async fn fetch_current_role(backend: Arc<dyn Backend>) -> Result<Role> {
  let user = backend
    .identity()
    .current_user()
    .await?
    .ok_or_else(|| CacheError::Unauthorized("not signed in".to_string()))?;
  let query = RowQuery::new().eq("user_id", user.as_str()).limit(1);
  let rows = backend.collection(USER_ROLES).read(&query).await?;
  Ok(
    rows
      .first()
      .and_then(|row| str_field(row, "role"))
      .and_then(|role| role.parse::<Role>().ok())
      .unwrap_or_default(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{Collection, Identity, MemoryBackend, ObjectStore, Row};
  use futures::future::{BoxFuture, FutureExt};
  use crate::cache::QueryStatus;
  use crate::tracker::types::Priority;

  fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  fn seeded() -> MemoryBackend {
    let backend = MemoryBackend::new().with_user("u1");
    backend.seed(
      ISSUES,
      vec![
        row(json!({"id": "1", "title": "Pump leak", "status": "open", "priority": "high",
          "reported_by": "u1", "created_at": "2024-05-01T08:00:00Z"})),
        row(json!({"id": "2", "title": "Sensor drift", "status": "pending", "priority": "low",
          "reported_by": "u2", "created_at": "2024-05-03T08:00:00Z"})),
        row(json!({"id": "3", "title": "Valve stuck", "status": "in_progress",
          "priority": "critical", "created_at": "2024-05-02T08:00:00Z"})),
      ],
    );
    backend.seed(
      PROFILES,
      vec![
        row(json!({"id": "u1", "full_name": "Ada Field", "email": "ada@example.com"})),
        row(json!({"id": "u2", "full_name": "Bo Tech"})),
      ],
    );
    backend.seed(
      USER_ROLES,
      vec![
        row(json!({"id": "r1", "user_id": "u1", "role": "admin"})),
        row(json!({"id": "r2", "user_id": "u2", "role": "technician"})),
      ],
    );
    backend
  }

  fn client(backend: &MemoryBackend) -> TrackerClient {
    TrackerClient::new(Arc::new(backend.clone()))
  }

  fn ids(issues: &[Issue]) -> Vec<&str> {
    issues.iter().map(|i| i.id.as_str()).collect()
  }

  /// Keep a key observed so invalidation refetches it.
  fn observe(tracker: &TrackerClient, key: TrackerQueryKey) -> crate::cache::Subscription {
    tracker
      .cache()
      .store()
      .subscribe(key.query_key(), Arc::new(|_, _| {}))
  }

  #[tokio::test]
  async fn test_issues_newest_first_with_reporter() {
    let backend = seeded();
    let tracker = client(&backend);

    let issues = tracker.issues().await.unwrap();
    assert_eq!(ids(&issues), vec!["2", "3", "1"]);
    assert_eq!(issues[2].reporter.as_ref().unwrap().full_name, "Ada Field");
    assert!(issues[1].reporter.is_none());

    tracker.issues().await.unwrap();
    assert_eq!(backend.read_count(ISSUES), 1);
  }

  #[tokio::test]
  async fn test_failed_status_update_rolls_back_both_views() {
    let backend = seeded();
    let tracker = client(&backend);
    tracker.issues().await.unwrap();
    tracker.issue("1").await.unwrap();

    backend.fail_next_writes(ISSUES, 1, CacheError::Transport("offline".into()));
    let result = tracker
      .update_issue("1", IssuePatch::status(IssueStatus::Closed))
      .await;

    assert_eq!(result, Err(CacheError::Transport("offline".into())));
    let list = tracker.cache().cached::<Vec<Issue>>(&TrackerQueryKey::Issues.query_key()).unwrap();
    assert_eq!(list.iter().find(|i| i.id == "1").unwrap().status, IssueStatus::Open);
    assert_eq!(tracker.cached_issue("1").unwrap().status, IssueStatus::Open);
    assert!(tracker.cached_issue("1").unwrap().resolved_at.is_none());
  }

  #[tokio::test]
  async fn test_status_update_keeps_list_and_entity_consistent() {
    let backend = seeded();
    let tracker = client(&backend);
    let _list = observe(&tracker, TrackerQueryKey::Issues);
    tracker.issues().await.unwrap();
    tracker.issue("1").await.unwrap();

    let updated = tracker
      .update_issue("1", IssuePatch::status(IssueStatus::Resolved))
      .await
      .unwrap();
    assert_eq!(updated.status, IssueStatus::Resolved);
    assert!(updated.resolved_at.is_some());

    let list = tracker.cache().cached::<Vec<Issue>>(&TrackerQueryKey::Issues.query_key()).unwrap();
    let entity = tracker.cache().cached::<Issue>(&TrackerQueryKey::issue("1").query_key()).unwrap();
    let in_list = list.iter().find(|i| i.id == "1").unwrap();
    assert_eq!(in_list.status, entity.status);
    assert_eq!(in_list.status, IssueStatus::Resolved);
    assert_eq!(
      tracker.cache().store().get(&TrackerQueryKey::Issues.query_key()).unwrap().status,
      QueryStatus::Fresh
    );
  }

  #[tokio::test]
  async fn test_delete_reconciles_list_with_backend() {
    let backend = seeded();
    let tracker = client(&backend);
    let _list = observe(&tracker, TrackerQueryKey::Issues);
    assert_eq!(tracker.issues().await.unwrap().len(), 3);

    tracker.delete_issue("1").await.unwrap();

    let list = tracker.cache().cached::<Vec<Issue>>(&TrackerQueryKey::Issues.query_key()).unwrap();
    assert_eq!(ids(&list), vec!["2", "3"]);
    assert_eq!(backend.read_count(ISSUES), 2);
    assert_eq!(backend.rows(ISSUES).len(), 2);
  }

  #[tokio::test]
  async fn test_failed_delete_restores_position() {
    let backend = seeded();
    let tracker = client(&backend);
    tracker.issues().await.unwrap();

    backend.fail_next_writes(ISSUES, 1, CacheError::Conflict("locked".into()));
    assert!(tracker.delete_issue("3").await.is_err());

    let list = tracker.cache().cached::<Vec<Issue>>(&TrackerQueryKey::Issues.query_key()).unwrap();
    assert_eq!(ids(&list), vec!["2", "3", "1"]);
  }

  #[tokio::test]
  async fn test_create_requires_user() {
    let backend = seeded();
    backend.sign_out();
    let tracker = client(&backend);

    let result = tracker.create_issue(NewIssue::new("Noise", "Loud bearing")).await;
    assert!(matches!(result, Err(CacheError::Unauthorized(_))));
    assert_eq!(backend.write_count(ISSUES), 0);
  }

  #[tokio::test]
  async fn test_create_shows_placeholder_until_refresh() {
    let backend = seeded();
    let tracker = client(&backend);
    tracker.issues().await.unwrap();

    let mut new = NewIssue::new("Noise", "Loud bearing");
    new.priority = Priority::Critical;
    let created = tracker.create_issue(new).await.unwrap();
    assert_eq!(created.reported_by.as_deref(), Some("u1"));

    // Nobody observes the list, so it is only marked stale.
    let key = TrackerQueryKey::Issues.query_key();
    let entry = tracker.cache().store().get(&key).unwrap();
    assert_eq!(entry.status, QueryStatus::Stale);
    let list = entry.data_as::<Vec<Issue>>().unwrap();
    assert!(list[0].id.starts_with("temp-"));
    assert_eq!(list[0].priority, Priority::Critical);

    let refreshed = tracker.issues().await.unwrap();
    assert_eq!(refreshed.len(), 4);
    assert!(refreshed.iter().any(|i| i.id == created.id));
    assert!(refreshed.iter().all(|i| !i.id.starts_with("temp-")));
    assert_eq!(backend.rows(ACTIVITY_LOGS).len(), 1);
  }

  #[tokio::test]
  async fn test_issue_update_note_is_signed() {
    let backend = seeded();
    let tracker = client(&backend);

    let issue = tracker.add_issue_update("1", "  Replaced seal ").await.unwrap();
    assert_eq!(issue.issue_updates.len(), 1);
    let note = &issue.issue_updates[0];
    assert_eq!(note.update_text, "Replaced seal");
    assert_eq!(note.updated_by, "u1");
    assert_eq!(note.updated_by_name.as_deref(), Some("Ada Field"));
  }

  /// Backend whose collection calls yield to the scheduler before running.
  struct Yielding(MemoryBackend);

  struct YieldingCollection(Arc<dyn Collection>);

  impl Collection for YieldingCollection {
    fn read<'a>(&'a self, query: &'a RowQuery) -> BoxFuture<'a, Result<Vec<Row>>> {
      async move {
        tokio::task::yield_now().await;
        self.0.read(query).await
      }
      .boxed()
    }

    fn insert(&self, row: Row) -> BoxFuture<'_, Result<Row>> {
      async move {
        tokio::task::yield_now().await;
        self.0.insert(row).await
      }
      .boxed()
    }

    fn update<'a>(&'a self, id: &'a str, patch: Row) -> BoxFuture<'a, Result<Row>> {
      async move {
        tokio::task::yield_now().await;
        self.0.update(id, patch).await
      }
      .boxed()
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
      async move {
        tokio::task::yield_now().await;
        self.0.remove(id).await
      }
      .boxed()
    }
  }

  impl Backend for Yielding {
    fn identity(&self) -> Arc<dyn Identity> {
      self.0.identity()
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
      Arc::new(YieldingCollection(self.0.collection(name)))
    }

    fn bucket(&self, name: &str) -> Arc<dyn ObjectStore> {
      self.0.bucket(name)
    }
  }

  #[tokio::test]
  async fn test_concurrent_notes_are_all_kept() {
    let backend = seeded();
    let tracker = TrackerClient::new(Arc::new(Yielding(backend.clone())));
    tracker.issue("1").await.unwrap();
    let _entity = observe(&tracker, TrackerQueryKey::issue("1"));

    let (first, second) = tokio::join!(
      tracker.add_issue_update("1", "first"),
      tracker.add_issue_update("1", "second"),
    );
    first.unwrap();
    second.unwrap();

    let stored = backend
      .rows(ISSUES)
      .into_iter()
      .find(|row| row_id(row).as_deref() == Some("1"))
      .unwrap();
    let mut texts: Vec<&str> = stored["issue_updates"]
      .as_array()
      .unwrap()
      .iter()
      .map(|note| note["update_text"].as_str().unwrap())
      .collect();
    texts.sort_unstable();
    assert_eq!(texts, vec!["first", "second"]);

    let cached = tracker.cached_issue("1").unwrap();
    assert_eq!(cached.issue_updates.len(), 2);
    assert_eq!(backend.rows(ACTIVITY_LOGS).len(), 2);
  }

  #[tokio::test]
  async fn test_blank_comment_never_reaches_backend() {
    let backend = seeded();
    let tracker = client(&backend);

    let result = tracker.add_comment("1", "   ").await;
    assert!(matches!(result, Err(CacheError::LocalApply { .. })));
    assert_eq!(backend.write_count(COMMENTS), 0);
  }

  #[tokio::test]
  async fn test_comment_appended_and_joined_with_author() {
    let backend = seeded();
    let tracker = client(&backend);
    let _comments = observe(&tracker, TrackerQueryKey::comments("1"));
    assert!(tracker.comments("1").await.unwrap().is_empty());

    tracker.add_comment("1", " Looking into it ").await.unwrap();

    let comments = tracker.comments("1").await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].content, "Looking into it");
    assert_eq!(comments[0].author.as_ref().unwrap().full_name, "Ada Field");
  }

  #[tokio::test]
  async fn test_oversized_attachment_rejected() {
    let backend = seeded();
    let tracker = client(&backend);

    let bytes = vec![0u8; MAX_ATTACHMENT_BYTES + 1];
    let result = tracker.upload_attachment("1", "dump.bin", bytes).await;
    assert!(matches!(result, Err(CacheError::LocalApply { .. })));
    assert_eq!(backend.write_count(ATTACHMENT_BUCKET), 0);
  }

  #[tokio::test]
  async fn test_attachment_upload_download_delete() {
    let backend = seeded();
    let tracker = client(&backend);
    let _attachments = observe(&tracker, TrackerQueryKey::attachments("1"));
    assert!(tracker.attachments("1").await.unwrap().is_empty());

    let attachment = tracker
      .upload_attachment("1", "photo.png", b"png-bytes".to_vec())
      .await
      .unwrap();
    assert!(attachment.file_path.starts_with("1/u1/"));
    assert!(attachment.file_path.ends_with(".png"));
    assert_eq!(attachment.file_size, 9);
    assert_eq!(tracker.attachments("1").await.unwrap().len(), 1);

    let bytes = tracker.download_attachment(&attachment.file_path).await.unwrap();
    assert_eq!(bytes, b"png-bytes");

    tracker.delete_attachment(&attachment).await.unwrap();
    assert!(tracker.attachments("1").await.unwrap().is_empty());
    assert!(backend.object(ATTACHMENT_BUCKET, &attachment.file_path).is_none());
  }

  #[tokio::test]
  async fn test_failed_record_insert_removes_upload() {
    let backend = seeded();
    let tracker = client(&backend);
    backend.fail_next_writes(ATTACHMENTS, 1, CacheError::Transport("offline".into()));

    let result = tracker.upload_attachment("1", "log.txt", b"x".to_vec()).await;
    assert!(result.is_err());
    assert_eq!(backend.write_count(ATTACHMENT_BUCKET), 2);
    assert!(backend.rows(ATTACHMENTS).is_empty());
  }

  #[tokio::test]
  async fn test_users_joined_with_roles() {
    let backend = seeded();
    let tracker = client(&backend);

    let users = tracker.users().await.unwrap();
    let roles: Vec<(&str, Role)> = users.iter().map(|u| (u.id.as_str(), u.role)).collect();
    assert_eq!(roles, vec![("u1", Role::Admin), ("u2", Role::Technician)]);
    assert_eq!(tracker.current_role().await.unwrap(), Role::Admin);
  }

  #[tokio::test]
  async fn test_admin_changes_role() {
    let backend = seeded();
    let tracker = client(&backend);
    tracker.users().await.unwrap();

    tracker.set_user_role("u2", Role::Manager).await.unwrap();

    let users = tracker.cache().cached::<Vec<UserProfile>>(&TrackerQueryKey::Users.query_key()).unwrap();
    assert_eq!(users.iter().find(|u| u.id == "u2").unwrap().role, Role::Manager);
    let rows = backend.rows(USER_ROLES);
    let u2: Vec<&Row> = rows.iter().filter(|r| str_field(r, "user_id") == Some("u2")).collect();
    assert_eq!(u2.len(), 1);
    assert_eq!(str_field(u2[0], "role"), Some("manager"));
  }

  #[tokio::test]
  async fn test_non_admin_cannot_change_roles() {
    let backend = seeded();
    backend.sign_in("u2");
    let tracker = client(&backend);

    let result = tracker.set_user_role("u1", Role::Reporter).await;
    assert!(matches!(result, Err(CacheError::Unauthorized(_))));
    assert_eq!(backend.write_count(USER_ROLES), 0);
  }

  #[tokio::test]
  async fn test_sign_out_clears_cache() {
    let backend = seeded();
    let tracker = client(&backend);
    tracker.issues().await.unwrap();

    tracker.sign_out();
    assert!(tracker.cached_issue("1").is_none());
    assert!(tracker.cache().store().is_empty());
  }
}
