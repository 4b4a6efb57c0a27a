//! Issue tracker domain on top of the query cache.

pub mod analytics;
pub mod client;
pub mod filters;
pub mod keys;
pub mod rows;
pub mod types;

pub use analytics::{Analytics, DayTrend};
pub use client::{TrackerClient, MAX_ATTACHMENT_BYTES};
pub use filters::{IssueFilter, IssueFilterField};
pub use keys::TrackerQueryKey;
pub use types::{
  ActivityLog, Attachment, Comment, Issue, IssuePatch, IssueStatus, IssueUpdate, NewIssue,
  Priority, ProfileRef, Role, UserProfile, View,
};
