use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::error::StartupError;

/// Durable record of report ids whose outcome has already been persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingCheckpoint {
    processed_ids: BTreeSet<String>,
    last_run_at: Option<DateTime<Utc>>,
}

impl ProcessingCheckpoint {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        Ok(atomic::read_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        atomic::write_json(path, self)
    }

    pub fn contains(&self, report_id: &str) -> bool {
        self.processed_ids.contains(report_id)
    }

    /// Only ever grows.
    pub fn record<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.processed_ids.extend(ids.into_iter().map(Into::into));
    }

    pub fn mark_run(&mut self, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
    }

    pub fn len(&self) -> usize {
        self.processed_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_ids_and_run_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = ProcessingCheckpoint::load(&path).unwrap();
        assert_eq!(checkpoint.len(), 0);

        let now = Utc::now();
        checkpoint.record(["r1", "r2"]);
        checkpoint.record(vec!["r2".to_string()]);
        checkpoint.mark_run(now);
        checkpoint.save(&path).unwrap();

        let reloaded = ProcessingCheckpoint::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("r1"));
        assert!(!reloaded.contains("r3"));
        assert_eq!(reloaded.last_run_at(), Some(now));
    }
}
