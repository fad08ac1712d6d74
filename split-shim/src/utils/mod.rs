//! Process-level helpers.

pub mod signals;
