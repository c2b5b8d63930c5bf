use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Dispatcher configuration handed to `Dispatcher::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Root directory of the central tier payload files.
    pub central_dir: PathBuf,
    /// Catalog database path; defaults to `catalog.db` inside `central_dir`.
    pub catalog_path: Option<PathBuf>,
}

impl DispatcherConfig {
    pub fn new(central_dir: impl Into<PathBuf>) -> Self {
        Self {
            central_dir: central_dir.into(),
            catalog_path: None,
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.central_dir.join("catalog.db"))
    }
}
