//! Query keys for tracker data.

use crate::cache::QueryKey;
use crate::query_key;

/// Every cached tracker query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackerQueryKey {
  /// All issues, newest first
  Issues,
  /// A single issue by id
  Issue { id: String },
  /// Comments on an issue, oldest first
  Comments { issue_id: String },
  /// Attachments on an issue, newest first
  Attachments { issue_id: String },
  /// Activity log of an issue, newest first
  ActivityLogs { issue_id: String },
  /// User list with roles
  Users,
  /// Role of the signed-in user
  CurrentRole,
}

impl TrackerQueryKey {
  pub fn issue(id: impl Into<String>) -> Self {
    Self::Issue { id: id.into() }
  }

  pub fn comments(issue_id: impl Into<String>) -> Self {
    Self::Comments {
      issue_id: issue_id.into(),
    }
  }

  pub fn attachments(issue_id: impl Into<String>) -> Self {
    Self::Attachments {
      issue_id: issue_id.into(),
    }
  }

  pub fn activity_logs(issue_id: impl Into<String>) -> Self {
    Self::ActivityLogs {
      issue_id: issue_id.into(),
    }
  }

  pub fn query_key(&self) -> QueryKey {
    match self {
      Self::Issues => query_key!["issues"],
      Self::Issue { id } => query_key!["issues", id],
      Self::Comments { issue_id } => query_key!["comments", issue_id],
      Self::Attachments { issue_id } => query_key!["attachments", issue_id],
      Self::ActivityLogs { issue_id } => query_key!["activity-logs", issue_id],
      Self::Users => query_key!["users"],
      Self::CurrentRole => query_key!["user-role"],
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Issues => "all issues".to_string(),
      Self::Issue { id } => format!("issue {}", id),
      Self::Comments { issue_id } => format!("comments on issue {}", issue_id),
      Self::Attachments { issue_id } => format!("attachments on issue {}", issue_id),
      Self::ActivityLogs { issue_id } => format!("activity on issue {}", issue_id),
      Self::Users => "all users".to_string(),
      Self::CurrentRole => "current role".to_string(),
    }
  }
}

impl From<TrackerQueryKey> for QueryKey {
  fn from(key: TrackerQueryKey) -> Self {
    key.query_key()
  }
}

impl From<&TrackerQueryKey> for QueryKey {
  fn from(key: &TrackerQueryKey) -> Self {
    key.query_key()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_issue_key_nests_under_list_key() {
    let list = TrackerQueryKey::Issues.query_key();
    let detail = TrackerQueryKey::issue("42").query_key();
    assert!(detail.starts_with(&list));
    assert!(!list.starts_with(&detail));
  }

  #[test]
  fn test_per_issue_keys_are_distinct() {
    let comments = TrackerQueryKey::comments("1").query_key();
    let attachments = TrackerQueryKey::attachments("1").query_key();
    let other = TrackerQueryKey::comments("2").query_key();
    assert_ne!(comments, attachments);
    assert_ne!(comments, other);
    assert_eq!(comments, query_key!["comments", "1"]);
  }

  #[test]
  fn test_description() {
    assert_eq!(TrackerQueryKey::issue("9").description(), "issue 9");
    assert_eq!(TrackerQueryKey::Users.description(), "all users");
  }
}
