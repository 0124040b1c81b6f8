//! Core data models for querybench.
//!
//! - K_i (Knowledge): job states and correlation ids are concrete types; transitions are checked
//! - B_i (Beliefs): provider answers and result lines arrive as Result/Option and are validated
//! - I^B (Bounded): every failure has a named error variant and a scope it is confined to

mod config;
mod error;
mod job;
mod payload;

pub use config::*;
pub use error::*;
pub use job::*;
pub use payload::*;
