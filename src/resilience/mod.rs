//! Failure handling for remote replay.

pub mod retry;
pub mod shutdown;
