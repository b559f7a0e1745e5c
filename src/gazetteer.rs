use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::atomic;
use crate::error::StartupError;
use crate::models::Coordinates;

pub const DEFAULT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GazetteerEntry {
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub centroid: Coordinates,
    pub source: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
}

impl GazetteerEntry {
    fn matches(&self, normalized: &str) -> bool {
        normalize(&self.canonical_name) == normalized
            || self.aliases.iter().any(|alias| normalize(alias) == normalized)
    }

    fn add_alias(&mut self, alias: &str) -> bool {
        let normalized = normalize(alias);
        if normalized.is_empty() || self.aliases.iter().any(|a| normalize(a) == normalized) {
            return false;
        }
        self.aliases.push(alias.trim().to_string());
        true
    }
}

/// Append-only cache of place names to coordinates, persisted as one JSON map.
#[derive(Debug, Default)]
pub struct Gazetteer {
    path: Option<PathBuf>,
    entries: BTreeMap<String, GazetteerEntry>,
}

impl Gazetteer {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let entries: BTreeMap<String, GazetteerEntry> =
            atomic::read_json(path)?.unwrap_or_default();
        info!(path = %path.display(), entries = entries.len(), "Loaded gazetteer");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// Case-insensitive exact match on canonical name or any alias.
    pub fn lookup(&self, query: &str) -> Option<(&str, &GazetteerEntry)> {
        let normalized = normalize(query);
        if normalized.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.matches(&normalized))
            .map(|(id, entry)| (id.as_str(), entry))
    }

    /// Record a resolved place and persist before returning.
    ///
    /// A place id that is already known gains the entry's aliases instead of
    /// being replaced.
    pub fn learn(&mut self, place_id: &str, mut entry: GazetteerEntry) -> anyhow::Result<()> {
        if entry.aliases.is_empty() {
            entry.aliases.push(entry.canonical_name.clone());
        }

        let changed = match self.entries.get_mut(place_id) {
            Some(existing) => entry
                .aliases
                .iter()
                .fold(false, |changed, alias| existing.add_alias(alias) || changed),
            None => {
                self.entries.insert(place_id.to_string(), entry);
                true
            }
        };

        if changed {
            debug!(place_id, "Gazetteer updated");
            self.persist()?;
        }
        Ok(())
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        match &self.path {
            Some(path) => atomic::write_json(path, &self.entries)
                .with_context(|| format!("failed to persist gazetteer {}", path.display())),
            None => Ok(()),
        }
    }

    /// Import known places from a CSV with `name,lat,lng[,aliases]` columns,
    /// aliases separated by `|`. Returns the number of new or extended entries.
    pub fn import_csv(&mut self, csv_path: &Path) -> anyhow::Result<usize> {
        #[derive(Deserialize)]
        struct CsvRow {
            name: String,
            lat: f64,
            lng: f64,
            #[serde(default)]
            aliases: Option<String>,
            #[serde(default)]
            confidence: Option<f64>,
        }

        let mut reader = csv::Reader::from_path(csv_path)
            .with_context(|| format!("failed to open {}", csv_path.display()))?;
        let mut imported = 0usize;

        for result in reader.deserialize::<CsvRow>() {
            let row = result?;
            let centroid = Coordinates::new(row.lat, row.lng);
            anyhow::ensure!(
                centroid.is_valid(),
                "coordinates out of range for '{}'",
                row.name
            );

            let mut aliases = vec![row.name.trim().to_string()];
            aliases.extend(
                row.aliases
                    .as_deref()
                    .unwrap_or_default()
                    .split('|')
                    .map(str::trim)
                    .filter(|alias| !alias.is_empty())
                    .map(str::to_string),
            );

            let place_id = format!("seed:{}", slug(&row.name));
            let before = self.entries.get(&place_id).map(|e| e.aliases.len());
            self.learn(
                &place_id,
                GazetteerEntry {
                    canonical_name: row.name.trim().to_string(),
                    aliases,
                    centroid,
                    source: "seed".to_string(),
                    confidence: row.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                    first_seen: Utc::now(),
                },
            )?;
            let after = self.entries.get(&place_id).map(|e| e.aliases.len());
            if before != after {
                imported += 1;
            }
        }

        Ok(imported)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub fn normalize(text: &str) -> String {
    text.trim().to_uppercase()
}

fn slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}
