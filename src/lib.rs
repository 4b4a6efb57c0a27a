//! issuedeck: an issue tracker client built on an optimistic mutation cache.
//!
//! - [`cache`]: query store, fetch coordinator, mutation executor and
//!   notification bus.
//! - [`backend`]: the backend collaborator traits with in-memory and SQLite
//!   implementations.
//! - [`tracker`]: issues, comments, attachments and roles on top of the cache.
//! - [`query`]: observer that binds a view to one cache key.

pub mod backend;
pub mod cache;
pub mod commands;
pub mod config;
pub mod logging;
pub mod query;
pub mod tracker;
