//! JSONL-directory training data source.
//!
//! Layout: one `<branch>.jsonl` file per branch under the data directory,
//! appended to by whatever produces training examples. A `<branch>.offset`
//! sidecar records how many lines previous training runs consumed.
//! Snapshots are written under `snapshots/` and the offset advances, so the
//! same data points are never trained on twice.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use forge_core::{Error, Result, TrainingDataSource};

pub struct JsonlDataSource {
    data_dir: PathBuf,
}

impl JsonlDataSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn data_file(&self, branch: &str) -> PathBuf {
        self.data_dir.join(format!("{branch}.jsonl"))
    }

    fn offset_file(&self, branch: &str) -> PathBuf {
        self.data_dir.join(format!("{branch}.offset"))
    }

    fn read_offset(&self, branch: &str) -> u64 {
        std::fs::read_to_string(self.offset_file(branch))
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    fn read_lines(path: &Path) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl TrainingDataSource for JsonlDataSource {
    async fn count_unconsumed(&self, branch: &str) -> Result<u64> {
        let path = self.data_file(branch);
        if !path.exists() {
            return Ok(0);
        }
        let total = Self::read_lines(&path)?.len() as u64;
        Ok(total.saturating_sub(self.read_offset(branch)))
    }

    async fn export_snapshot(&self, branch: &str, cap: u64) -> Result<PathBuf> {
        let path = self.data_file(branch);
        let lines = match Self::read_lines(&path) {
            Ok(lines) => lines,
            Err(e) => {
                return Err(Error::DatasetUnavailable {
                    branch: branch.to_string(),
                    message: format!("cannot read {}: {}", path.display(), e),
                })
            }
        };

        let offset = self.read_offset(branch) as usize;
        let unconsumed = lines.len().saturating_sub(offset);
        if unconsumed == 0 {
            return Err(Error::DatasetUnavailable {
                branch: branch.to_string(),
                message: "no unconsumed data points".to_string(),
            });
        }

        let take = unconsumed.min(cap as usize);
        let snapshot_dir = self.data_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir)?;

        // Offset in the name keeps back-to-back exports from colliding.
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let snapshot_path = snapshot_dir.join(format!("{branch}-{stamp}-{offset}.jsonl"));
        let mut body = lines[offset..offset + take].join("\n");
        body.push('\n');
        std::fs::write(&snapshot_path, body)?;

        // Advance the offset only after the snapshot exists on disk.
        std::fs::write(self.offset_file(branch), (offset + take).to_string())?;

        debug!(
            subsystem = "datasource",
            op = "export_snapshot",
            branch,
            exported = take,
            remaining = unconsumed - take,
            path = %snapshot_path.display(),
            "Dataset snapshot exported"
        );
        Ok(snapshot_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_data(dir: &Path, branch: &str, lines: usize) {
        let body: String = (0..lines)
            .map(|i| format!("{{\"prompt\": \"q{i}\", \"completion\": \"a{i}\"}}\n"))
            .collect();
        std::fs::write(dir.join(format!("{branch}.jsonl")), body).unwrap();
    }

    #[tokio::test]
    async fn count_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlDataSource::new(dir.path());
        assert_eq!(source.count_unconsumed("math").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_ignores_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("math.jsonl"), "{\"a\":1}\n\n{\"a\":2}\n\n").unwrap();
        let source = JsonlDataSource::new(dir.path());
        assert_eq!(source.count_unconsumed("math").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn export_caps_and_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "math", 10);
        let source = JsonlDataSource::new(dir.path());

        let snapshot = source.export_snapshot("math", 6).await.unwrap();
        let exported = std::fs::read_to_string(&snapshot).unwrap();
        assert_eq!(exported.lines().count(), 6);
        assert!(exported.starts_with("{\"prompt\": \"q0\""));

        // The remaining four points are still countable and exportable.
        assert_eq!(source.count_unconsumed("math").await.unwrap(), 4);
        let second = source.export_snapshot("math", 6).await.unwrap();
        let exported = std::fs::read_to_string(&second).unwrap();
        assert_eq!(exported.lines().count(), 4);
        assert!(exported.starts_with("{\"prompt\": \"q6\""));

        assert_eq!(source.count_unconsumed("math").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn export_missing_file_is_dataset_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlDataSource::new(dir.path());
        let err = source.export_snapshot("math", 10).await.unwrap_err();
        assert!(matches!(err, Error::DatasetUnavailable { .. }));
    }

    #[tokio::test]
    async fn export_fully_consumed_is_dataset_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "math", 3);
        let source = JsonlDataSource::new(dir.path());

        source.export_snapshot("math", 10).await.unwrap();
        let err = source.export_snapshot("math", 10).await.unwrap_err();
        assert!(matches!(err, Error::DatasetUnavailable { .. }));
    }

    #[tokio::test]
    async fn branches_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "math", 5);
        write_data(dir.path(), "chemistry", 2);
        let source = JsonlDataSource::new(dir.path());

        source.export_snapshot("math", 100).await.unwrap();
        assert_eq!(source.count_unconsumed("math").await.unwrap(), 0);
        assert_eq!(source.count_unconsumed("chemistry").await.unwrap(), 2);
    }
}
