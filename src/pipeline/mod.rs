//! Batch lifecycle pipeline.
//!
//! Submit -> (persist) -> Poll -> (download) -> Normalize -> canonical records.

mod dispatcher;
mod normalizer;
mod poller;

pub use dispatcher::*;
pub use normalizer::*;
pub use poller::*;

use crate::models::{BatchError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::time::Duration;

/// Run one adapter call under a deadline.
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| BatchError::Timeout(deadline))?
}

/// Progress bar in the house style; falls back to the default look if the template is rejected.
pub(crate) fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
    {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}
