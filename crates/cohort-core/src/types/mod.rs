//! Core types for Cohort

mod cluster;
mod event;

pub use cluster::*;
pub use event::*;
