//! Summary counts over the issue list.

use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use super::types::{Issue, IssueStatus, Priority};

/// Issues opened and resolved on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DayTrend {
  pub opened: usize,
  pub resolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Analytics {
  pub total: usize,
  pub by_status: BTreeMap<IssueStatus, usize>,
  pub by_priority: BTreeMap<Priority, usize>,
  /// Only issues with a responsible department are counted.
  pub by_department: BTreeMap<String, usize>,
  pub trend: BTreeMap<NaiveDate, DayTrend>,
}

impl Analytics {
  pub fn from_issues(issues: &[Issue]) -> Self {
    let mut analytics = Analytics {
      total: issues.len(),
      ..Analytics::default()
    };

    for issue in issues {
      *analytics.by_status.entry(issue.status).or_default() += 1;
      *analytics.by_priority.entry(issue.priority).or_default() += 1;

      if let Some(department) = issue
        .responsible_department
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
      {
        *analytics
          .by_department
          .entry(department.to_string())
          .or_default() += 1;
      }

      if let Some(day) = day_of(&issue.created_at) {
        analytics.trend.entry(day).or_default().opened += 1;
      }
      if let Some(day) = issue.resolved_at.as_deref().and_then(day_of) {
        analytics.trend.entry(day).or_default().resolved += 1;
      }
    }
    analytics
  }

  /// Issues not yet resolved or closed.
  pub fn open_count(&self) -> usize {
    self
      .by_status
      .iter()
      .filter(|(status, _)| !status.is_done())
      .map(|(_, count)| count)
      .sum()
  }

  pub fn status_count(&self, status: IssueStatus) -> usize {
    self.by_status.get(&status).copied().unwrap_or_default()
  }

  pub fn priority_count(&self, priority: Priority) -> usize {
    self.by_priority.get(&priority).copied().unwrap_or_default()
  }
}

/// Calendar day of an RFC 3339 timestamp or a bare `YYYY-MM-DD` date.
fn day_of(timestamp: &str) -> Option<NaiveDate> {
  DateTime::parse_from_rfc3339(timestamp)
    .map(|dt| dt.date_naive())
    .ok()
    .or_else(|| timestamp.get(..10)?.parse().ok())
}
