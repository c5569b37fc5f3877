//! Mail log line handling: timestamp extraction and event classification.

pub mod classifier;
pub mod timestamp;

pub use classifier::{Category, Classifier};
