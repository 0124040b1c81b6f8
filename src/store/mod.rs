//! Durable storage for batch job state.
//!
//! Provides:
//! - `JobStore`: file-backed job table with load / save / upsert
//! - `write_atomic`: write-then-rename helper shared with result output

mod atomic;
mod job_store;

pub use atomic::*;
pub use job_store::*;
