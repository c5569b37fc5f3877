//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use mailpulse::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, FixedClock, SystemClock};
pub use crate::core::config::Config;
pub use crate::core::errors::{MpError, Result};

// Platform
pub use crate::platform::exec::{CommandOutput, CommandRunner, PrivilegedExecutor, ScriptedRunner};
pub use crate::platform::facts::{FactsCollector, SystemFacts};

// Logging
pub use crate::logger::activity::{ActivityLoggerHandle, spawn_logger};
pub use crate::logger::jsonl::JsonlConfig;

// Log pipeline
pub use crate::logs::classifier::{Category, Classifier};
pub use crate::source::reader::{LineReader, RelevantLines};
pub use crate::source::resolver::{SourceDescriptor, SourceMode, SourceResolver};
pub use crate::stats::aggregate::{SeriesReport, TodayStats};
pub use crate::stats::talkers::{TalkerSpan, TalkerTable};
pub use crate::stats::window::{TimeWindow, WindowKind};

// Collectors
pub use crate::collectors::queue::QueueStatus;
pub use crate::collectors::sessions::SessionCounts;
pub use crate::collectors::totals::Totals;

// API
pub use crate::api::endpoint::{ApiResponse, Endpoint, RequestParams, dispatch};
pub use crate::api::monitor::{HealthReport, Monitor};
