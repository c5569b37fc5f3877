//! Windowed aggregation and address ranking over relevant lines.

pub mod aggregate;
pub mod talkers;
pub mod window;

pub use aggregate::{SeriesReport, TodayStats, aggregate, today_summary};
pub use talkers::{TalkerExtractor, TalkerSpan, TalkerTable};
pub use window::{TimeWindow, WindowKind};
