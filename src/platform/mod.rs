//! Operating-system plumbing: bounded command execution and host facts.

pub mod exec;
pub mod facts;
