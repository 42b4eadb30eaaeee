//! Small self-contained helpers shared by the edit engine and tool layer.

pub mod change_tracker;
pub mod diff;
