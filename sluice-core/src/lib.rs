//! Ingest-and-dispatch engine for the sluice file-analysis pipeline.
//!
//! The engine turns raw submission requests into bounded, ordered,
//! retry-safe per-service tasks and drives them to completion:
//!
//! - [`ingest::Ingester`] validates, deduplicates, prioritizes, and admits
//!   requests, and fans completions out to callers and folded duplicates.
//! - [`ingest::Submitter`] promotes unique work into submissions.
//! - [`dispatch::FileDispatcher`] schedules each file through its ordered
//!   service stages.
//! - [`dispatch::SubmissionDispatcher`] aggregates per-file completions
//!   into a finished submission.
//! - [`watcher`] delivers stored messages on deadlines, covering timeouts,
//!   retries, and crash recovery.
//!
//! Analyzer fleets integrate through [`dispatch::DispatchClient`]; external
//! policy (schedules, scoring, whitelists, the service registry) is
//! injected as a [`capabilities::Capabilities`] set.

pub mod broker;
pub mod cache;
pub mod capabilities;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod locks;
pub mod plumber;
pub mod registry;
pub mod runtime;
pub mod watcher;

pub use capabilities::{Capabilities, Schedule, WhitelistHit};
pub use error::{CoreError, Result};
