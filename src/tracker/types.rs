//! Domain types for the issue tracker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workflow status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
  Pending,
  #[default]
  Open,
  InProgress,
  Resolved,
  Closed,
}

impl IssueStatus {
  pub const ALL: [IssueStatus; 5] = [
    IssueStatus::Pending,
    IssueStatus::Open,
    IssueStatus::InProgress,
    IssueStatus::Resolved,
    IssueStatus::Closed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      IssueStatus::Pending => "pending",
      IssueStatus::Open => "open",
      IssueStatus::InProgress => "in_progress",
      IssueStatus::Resolved => "resolved",
      IssueStatus::Closed => "closed",
    }
  }

  /// Resolved and closed issues count as done.
  pub fn is_done(&self) -> bool {
    matches!(self, IssueStatus::Resolved | IssueStatus::Closed)
  }
}

impl fmt::Display for IssueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for IssueStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
    IssueStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == normalized)
      .ok_or_else(|| format!("unknown status '{}'", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

impl Priority {
  pub const ALL: [Priority; 4] = [
    Priority::Low,
    Priority::Medium,
    Priority::High,
    Priority::Critical,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Critical => "critical",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase();
    Priority::ALL
      .into_iter()
      .find(|p| p.as_str() == normalized)
      .ok_or_else(|| format!("unknown priority '{}'", s))
  }
}

/// Role of a user. Users without a role row are reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  #[default]
  Reporter,
  Technician,
  Manager,
  Admin,
}

impl Role {
  pub const ALL: [Role; 4] = [Role::Reporter, Role::Technician, Role::Manager, Role::Admin];

  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Reporter => "reporter",
      Role::Technician => "technician",
      Role::Manager => "manager",
      Role::Admin => "admin",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase();
    Role::ALL
      .into_iter()
      .find(|r| r.as_str() == normalized)
      .ok_or_else(|| format!("unknown role '{}'", s))
  }
}

impl Role {
  /// Whether this role may open `view`.
  pub fn can_view(&self, view: View) -> bool {
    match view {
      View::Dashboard | View::Issues => true,
      View::Analytics => matches!(self, Role::Manager | Role::Admin),
      View::Admin => *self == Role::Admin,
    }
  }
}

/// Top-level screens of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
  Dashboard,
  Issues,
  Analytics,
  Admin,
}

impl View {
  pub const ALL: [View; 4] = [View::Dashboard, View::Issues, View::Analytics, View::Admin];

  /// Views `role` may open, in menu order.
  pub fn visible_to(role: Role) -> Vec<View> {
    View::ALL.into_iter().filter(|view| role.can_view(*view)).collect()
  }
}

/// Display fields of the profile joined onto issues and comments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileRef {
  #[serde(default)]
  pub full_name: String,
  #[serde(default)]
  pub email: Option<String>,
}

/// A progress note appended to an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueUpdate {
  pub update_text: String,
  pub update_date: String,
  pub updated_by: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_by_name: Option<String>,
}

/// Full issue record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Issue {
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub status: IssueStatus,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub component: Option<String>,
  #[serde(default)]
  pub operator: Option<String>,
  #[serde(default)]
  pub responsible_department: Option<String>,
  #[serde(default)]
  pub issue_logger: Option<String>,
  #[serde(default)]
  pub resolution_steps: Option<String>,
  #[serde(default)]
  pub issue_updates: Vec<IssueUpdate>,
  #[serde(default)]
  pub technical_team_notified: bool,
  #[serde(default)]
  pub notify_flag: bool,
  #[serde(default)]
  pub closing_date: Option<String>,
  #[serde(default)]
  pub time_to_resolve: Option<String>,
  #[serde(default)]
  pub date: Option<String>,
  #[serde(default)]
  pub reported_by: Option<String>,
  #[serde(default)]
  pub assigned_to: Option<String>,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub updated_at: String,
  #[serde(default)]
  pub resolved_at: Option<String>,
  /// Reporter profile, joined client-side. Never written back.
  #[serde(default, skip_serializing)]
  pub reporter: Option<ProfileRef>,
}

/// Fields for a new issue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewIssue {
  pub title: String,
  pub description: String,
  pub status: IssueStatus,
  pub priority: Priority,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub component: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub operator: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub responsible_department: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub issue_logger: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolution_steps: Option<String>,
  pub technical_team_notified: bool,
  pub notify_flag: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date: Option<String>,
}

impl NewIssue {
  pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      description: description.into(),
      ..Self::default()
    }
  }

  /// The issue as it appears in lists before the backend assigns an id.
  pub fn to_placeholder(&self, id: String, reported_by: &str, now: &str) -> Issue {
    Issue {
      id,
      title: self.title.clone(),
      description: self.description.clone(),
      status: self.status,
      priority: self.priority,
      component: self.component.clone(),
      operator: self.operator.clone(),
      responsible_department: self.responsible_department.clone(),
      issue_logger: self.issue_logger.clone(),
      resolution_steps: self.resolution_steps.clone(),
      technical_team_notified: self.technical_team_notified,
      notify_flag: self.notify_flag,
      date: self.date.clone(),
      reported_by: Some(reported_by.to_string()),
      created_at: now.to_string(),
      updated_at: now.to_string(),
      ..Issue::default()
    }
  }
}

/// Partial update of an issue. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssuePatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<IssueStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub component: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub responsible_department: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolution_steps: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub technical_team_notified: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assigned_to: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub issue_updates: Option<Vec<IssueUpdate>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub closing_date: Option<String>,
}

impl IssuePatch {
  pub fn status(status: IssueStatus) -> Self {
    Self {
      status: Some(status),
      ..Self::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// Reject patches that would leave an issue invalid.
  pub fn validate(&self) -> Result<(), String> {
    if self.is_empty() {
      return Err("patch changes nothing".to_string());
    }
    if matches!(&self.title, Some(t) if t.trim().is_empty()) {
      return Err("title cannot be empty".to_string());
    }
    Ok(())
  }

  /// Apply to a cached issue, stamping `updated_at` with `now`.
  pub fn apply_to(&self, issue: &mut Issue, now: &str) -> Result<(), String> {
    self.validate()?;
    if let Some(title) = &self.title {
      issue.title = title.clone();
    }
    if let Some(description) = &self.description {
      issue.description = description.clone();
    }
    if let Some(status) = self.status {
      issue.status = status;
    }
    if let Some(priority) = self.priority {
      issue.priority = priority;
    }
    if let Some(component) = &self.component {
      issue.component = Some(component.clone());
    }
    if let Some(department) = &self.responsible_department {
      issue.responsible_department = Some(department.clone());
    }
    if let Some(steps) = &self.resolution_steps {
      issue.resolution_steps = Some(steps.clone());
    }
    if let Some(notified) = self.technical_team_notified {
      issue.technical_team_notified = notified;
    }
    if let Some(assignee) = &self.assigned_to {
      issue.assigned_to = Some(assignee.clone());
    }
    if let Some(updates) = &self.issue_updates {
      issue.issue_updates = updates.clone();
    }
    if let Some(resolved_at) = &self.resolved_at {
      issue.resolved_at = Some(resolved_at.clone());
    }
    if let Some(closing_date) = &self.closing_date {
      issue.closing_date = Some(closing_date.clone());
    }
    issue.updated_at = now.to_string();
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
  pub id: String,
  pub issue_id: String,
  pub user_id: String,
  pub content: String,
  #[serde(default)]
  pub created_at: String,
  #[serde(default, skip_serializing)]
  pub author: Option<ProfileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
  pub id: String,
  pub issue_id: String,
  pub file_name: String,
  pub file_path: String,
  pub file_size: u64,
  pub uploaded_by: String,
  #[serde(default)]
  pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
  pub id: String,
  pub issue_id: String,
  pub user_id: String,
  pub action: String,
  #[serde(default)]
  pub details: serde_json::Value,
  #[serde(default)]
  pub created_at: String,
  #[serde(default, skip_serializing)]
  pub actor: Option<ProfileRef>,
}

/// A user as listed in the admin view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  #[serde(default)]
  pub full_name: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub role: Role,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_parsing_accepts_display_forms() {
    assert_eq!("in progress".parse::<IssueStatus>(), Ok(IssueStatus::InProgress));
    assert_eq!("In-Progress".parse::<IssueStatus>(), Ok(IssueStatus::InProgress));
    assert_eq!("closed".parse::<IssueStatus>(), Ok(IssueStatus::Closed));
    assert!("done".parse::<IssueStatus>().is_err());
  }

  #[test]
  fn test_role_gating() {
    assert_eq!(View::visible_to(Role::Reporter), vec![View::Dashboard, View::Issues]);
    assert_eq!(View::visible_to(Role::Technician), vec![View::Dashboard, View::Issues]);
    assert!(Role::Manager.can_view(View::Analytics));
    assert!(!Role::Manager.can_view(View::Admin));
    assert_eq!(View::visible_to(Role::Admin), View::ALL.to_vec());
  }

  #[test]
  fn test_status_serializes_snake_case() {
    let json = serde_json::to_string(&IssueStatus::InProgress).unwrap();
    assert_eq!(json, r#""in_progress""#);
  }

  #[test]
  fn test_patch_applies_only_set_fields() {
    let mut issue = Issue {
      id: "1".into(),
      title: "Leak".into(),
      priority: Priority::High,
      ..Issue::default()
    };
    IssuePatch::status(IssueStatus::Closed)
      .apply_to(&mut issue, "2024-05-01T00:00:00Z")
      .unwrap();

    assert_eq!(issue.status, IssueStatus::Closed);
    assert_eq!(issue.title, "Leak");
    assert_eq!(issue.priority, Priority::High);
    assert_eq!(issue.updated_at, "2024-05-01T00:00:00Z");
  }

  #[test]
  fn test_patch_rejects_blank_title_and_empty_patch() {
    let mut issue = Issue::default();
    let blank = IssuePatch {
      title: Some("  ".into()),
      ..IssuePatch::default()
    };
    assert!(blank.apply_to(&mut issue, "now").is_err());
    assert!(IssuePatch::default().apply_to(&mut issue, "now").is_err());
    assert_eq!(issue, Issue::default());
  }

  #[test]
  fn test_patch_serializes_without_unset_fields() {
    let value = serde_json::to_value(IssuePatch::status(IssueStatus::Open)).unwrap();
    assert_eq!(value, serde_json::json!({"status": "open"}));
  }

  #[test]
  fn test_issue_reads_sparse_rows() {
    let issue: Issue = serde_json::from_value(serde_json::json!({
      "id": "7",
      "title": "Broken pump",
      "status": "pending",
      "issue_updates": [],
      "extra_column": 1
    }))
    .unwrap();
    assert_eq!(issue.status, IssueStatus::Pending);
    assert_eq!(issue.priority, Priority::Medium);
    assert!(issue.reporter.is_none());
  }
}
