#![forbid(unsafe_code)]

//! mailpulse: mail-server health from MTA logs, the mail queue and session
//! probes, served as small JSON documents.
//!
//! Pipeline:
//! 1. **Source resolution**: pick log files by glob, or fall back to the journal
//! 2. **Relevant-line reading**: bounded `grep`/`zgrep`/`journalctl` runs
//! 3. **Classification and aggregation**: per-category bucketed series
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use mailpulse::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use mailpulse::core::config::Config;
//! use mailpulse::stats::window::{TimeWindow, WindowKind};
//! ```

pub mod prelude;

pub mod api;
pub mod collectors;
pub mod core;
pub mod logger;
pub mod logs;
pub mod platform;
pub mod source;
pub mod stats;
