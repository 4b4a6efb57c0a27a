//! Issue list filtering: free-text search plus status and priority filters,
//! and grouping fields for faceted views.

use std::collections::BTreeSet;

use super::types::{Issue, IssueStatus, Priority};

/// Search and filter settings for an issue list. Unset filters mean "all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
  pub search: Option<String>,
  pub status: Option<IssueStatus>,
  pub priority: Option<Priority>,
}

impl IssueFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn search(mut self, term: impl Into<String>) -> Self {
    let term = term.into();
    self.search = (!term.trim().is_empty()).then_some(term);
    self
  }

  pub fn status(mut self, status: IssueStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = Some(priority);
    self
  }

  /// Case-insensitive search over title and description.
  pub fn matches(&self, issue: &Issue) -> bool {
    let matches_search = self.search.as_deref().map_or(true, |term| {
      let term = term.trim().to_lowercase();
      issue.title.to_lowercase().contains(&term) || issue.description.to_lowercase().contains(&term)
    });
    let matches_status = self.status.map_or(true, |status| issue.status == status);
    let matches_priority = self.priority.map_or(true, |priority| issue.priority == priority);
    matches_search && matches_status && matches_priority
  }

  pub fn apply<'a>(&self, issues: &'a [Issue]) -> Vec<&'a Issue> {
    issues.iter().filter(|issue| self.matches(issue)).collect()
  }
}

/// Field to group issues by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IssueFilterField {
  #[default]
  None,
  Status,
  Priority,
  Department,
  Assignee,
}

impl IssueFilterField {
  pub const ALL: [IssueFilterField; 5] = [
    IssueFilterField::None,
    IssueFilterField::Status,
    IssueFilterField::Priority,
    IssueFilterField::Department,
    IssueFilterField::Assignee,
  ];

  pub fn label(&self) -> &'static str {
    match self {
      IssueFilterField::None => "None",
      IssueFilterField::Status => "Status",
      IssueFilterField::Priority => "Priority",
      IssueFilterField::Department => "Department",
      IssueFilterField::Assignee => "Assignee",
    }
  }

  /// Extract the value of this field from an issue
  fn extract(&self, issue: &Issue) -> Option<String> {
    match self {
      IssueFilterField::None => None,
      IssueFilterField::Status => Some(issue.status.to_string()),
      IssueFilterField::Priority => Some(issue.priority.to_string()),
      IssueFilterField::Department => issue.responsible_department.clone(),
      IssueFilterField::Assignee => issue.assigned_to.clone(),
    }
  }

  pub fn is_active(&self) -> bool {
    !matches!(self, IssueFilterField::None)
  }

  /// Distinct values present in `issues`, with `None` (unset) first.
  pub fn unique_values(&self, issues: &[Issue]) -> Vec<Option<String>> {
    if !self.is_active() {
      return Vec::new();
    }

    let values: BTreeSet<Option<String>> = issues.iter().map(|issue| self.extract(issue)).collect();
    // BTreeSet orders None before Some
    values.into_iter().collect()
  }

  /// Filter issues by a value.
  /// - `None` means "All" (no filtering)
  /// - `Some(None)` keeps issues with the field unset
  pub fn filter<'a>(&self, issues: &'a [Issue], value: Option<&Option<String>>) -> Vec<&'a Issue> {
    match value {
      None => issues.iter().collect(),
      Some(wanted) => issues
        .iter()
        .filter(|issue| self.extract(issue) == *wanted)
        .collect(),
    }
  }
}
