//! Command-backed probes beside the log pipeline: queue, sessions, totals.

pub mod queue;
pub mod sessions;
pub mod totals;

pub use queue::{QueueCollector, QueueStatus};
pub use sessions::{SessionCollector, SessionCounts, SessionProbe};
pub use totals::{Totals, TotalsCollector};
