//! Built-in metrics sources
//!
//! `JsonFileSource` reads a document written by an external runtime poller:
//!
//! ```json
//! { "3f2a9c": { "name": "db-1", "snapshot": { "cpu_percent": 12.5, ... } } }
//! ```

use super::MetricsSource;
use crate::models::{MetricSnapshot, TargetRef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    #[serde(default)]
    snapshot: MetricSnapshot,
}

/// Reads targets and snapshots from a JSON file on every call
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, FileEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read metrics file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse metrics file {}", self.path.display()))
    }
}

#[async_trait]
impl MetricsSource for JsonFileSource {
    async fn list_targets(&self) -> Result<Vec<TargetRef>> {
        Ok(self
            .read()
            .await?
            .into_iter()
            .map(|(id, entry)| TargetRef::new(id, entry.name))
            .collect())
    }

    async fn sample(&self, target: &TargetRef) -> Result<MetricSnapshot> {
        let mut entries = self.read().await?;
        let entry = entries
            .remove(&target.id)
            .with_context(|| format!("No reading for target {}", target))?;
        Ok(entry.snapshot)
    }
}

/// In-process source fed by the caller
#[derive(Default)]
pub struct StaticSource {
    readings: DashMap<String, (TargetRef, Option<MetricSnapshot>)>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the next reading for `target`
    pub fn set(&self, target: TargetRef, snapshot: MetricSnapshot) {
        self.readings
            .insert(target.id.clone(), (target, Some(snapshot)));
    }

    /// Make sampling `target` fail until the next `set`
    pub fn fail(&self, target: TargetRef) {
        self.readings.insert(target.id.clone(), (target, None));
    }

    pub fn remove(&self, target_id: &str) {
        self.readings.remove(target_id);
    }
}

#[async_trait]
impl MetricsSource for StaticSource {
    async fn list_targets(&self) -> Result<Vec<TargetRef>> {
        let mut targets: Vec<TargetRef> = self
            .readings
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(targets)
    }

    async fn sample(&self, target: &TargetRef) -> Result<MetricSnapshot> {
        match self.readings.get(&target.id) {
            Some(entry) => entry
                .value()
                .1
                .clone()
                .with_context(|| format!("Sampling failed for {}", target)),
            None => anyhow::bail!("Unknown target {}", target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_file_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        tokio::fs::write(
            &path,
            r#"{
                "c-2": {"name": "api-2", "snapshot": {"timestamp": 10, "cpu_percent": 12.5}},
                "c-1": {"name": "db-1"}
            }"#,
        )
        .await
        .unwrap();

        let source = JsonFileSource::new(&path);
        let targets = source.list_targets().await.unwrap();
        assert_eq!(
            targets,
            vec![TargetRef::new("c-1", "db-1"), TargetRef::new("c-2", "api-2")]
        );

        let snapshot = source.sample(&targets[1]).await.unwrap();
        assert_eq!(snapshot.cpu_percent, 12.5);
        assert_eq!(snapshot.timestamp, 10);

        assert!(source
            .sample(&TargetRef::new("c-9", "gone"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_json_file_source_missing_file() {
        let dir = TempDir::new().unwrap();
        let source = JsonFileSource::new(dir.path().join("absent.json"));
        assert!(source.list_targets().await.is_err());
    }

    #[tokio::test]
    async fn test_static_source_failure() {
        let source = StaticSource::new();
        let target = TargetRef::new("c-1", "db-1");
        source.fail(target.clone());
        assert!(source.sample(&target).await.is_err());

        source.set(target.clone(), MetricSnapshot::default());
        assert!(source.sample(&target).await.is_ok());
    }
}
