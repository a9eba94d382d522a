use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of fetcher threads. `None` uses the available hardware parallelism.
    pub num_fetcher_threads: Option<usize>,
    /// Soft cap on queued fetch tasks. Tasks beyond it are rejected and re-issued on next access.
    pub max_queued_tasks: usize,
    /// How many tasks survive `prepare_next_frame` as prefetch work.
    pub prefetch_capacity: usize,
    /// Value for voxels not covered by a (boundary or absent) block.
    pub fill_value: f64,
}
impl CacheConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse cache config")
    }
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config {}", path.display()))?;
        Self::from_json(&json)
    }
    pub fn fetcher_threads(&self) -> usize {
        self.num_fetcher_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_fetcher_threads: None,
            max_queued_tasks: 1 << 16,
            prefetch_capacity: 4096,
            fill_value: 0.0,
        }
    }
}
