//! File-backed persistence for topic schemas, users, groups, plugin configs
//! and message bodies.
//!
//! Records are stored as JSON lines under the configured base directory.

mod repository;

pub use repository::*;

use std::path::Path;

use crate::errors::AppError;

/// Sub-directories created under the base path on first start.
pub const LAYOUT: &[&str] = &["export", "import", "index", "reports", "topics"];

/// Create the base directory layout if it does not exist yet.
pub async fn init_base(base: &Path) -> Result<(), AppError> {
    for dir in LAYOUT {
        tokio::fs::create_dir_all(base.join(dir)).await?;
    }
    Ok(())
}
