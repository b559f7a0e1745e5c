use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::DEFAULT_THRESHOLD_KM;
use crate::retry::RetryPolicy;

pub const DEFAULT_EXTRACTION_URL: &str = "https://router.huggingface.co/v1";
pub const DEFAULT_EXTRACTION_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct:novita";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";

/// How a run's incidents reach the incident store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreWriteMode {
    /// Insert or overwrite each incident by id.
    #[default]
    Upsert,
    /// Replace the store contents with this run's incidents.
    Replace,
}

impl FromStr for StoreWriteMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(Self::Upsert),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown store write mode: {other} (expected upsert|replace)")),
        }
    }
}

impl fmt::Display for StoreWriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upsert => "upsert",
            Self::Replace => "replace",
        })
    }
}

/// Everything a pipeline run needs, independent of how it was supplied.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub checkpoint: PathBuf,
    pub gazetteer: PathBuf,
    pub summary_out: Option<PathBuf>,

    /// Ordered credentials for generative extraction.
    pub extraction_tokens: Vec<String>,
    pub extraction_url: Option<String>,
    pub extraction_model: String,
    /// Ordered credentials for the geocoder; empty means anonymous access.
    pub geocoder_tokens: Vec<String>,
    pub geocoder_url: Option<String>,

    pub distance_threshold_km: f64,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub call_timeout: Duration,
    pub max_external_calls: Option<usize>,
    pub store_write_mode: StoreWriteMode,
    pub call_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("pipeline_output/04_final_results.jsonl"),
            output: PathBuf::from("pipeline_output/incidents.json"),
            checkpoint: PathBuf::from("pipeline_output/processed_ids.json"),
            gazetteer: PathBuf::from("pipeline_output/location_db.json"),
            summary_out: None,
            extraction_tokens: Vec::new(),
            extraction_url: Some(DEFAULT_EXTRACTION_URL.to_string()),
            extraction_model: DEFAULT_EXTRACTION_MODEL.to_string(),
            geocoder_tokens: Vec::new(),
            geocoder_url: Some(DEFAULT_GEOCODER_URL.to_string()),
            distance_threshold_km: DEFAULT_THRESHOLD_KM,
            batch_size: 20,
            batch_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(20),
            max_external_calls: None,
            store_write_mode: StoreWriteMode::Upsert,
            call_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch size must be at least 1");
        anyhow::ensure!(
            self.distance_threshold_km.is_finite() && self.distance_threshold_km >= 0.0,
            "distance threshold must be a non-negative number of kilometres"
        );
        Ok(())
    }
}

/// Split a comma separated credential list, dropping blanks.
pub fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.distance_threshold_km, 50.0);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.batch_delay, Duration::from_secs(2));
        assert_eq!(config.call_timeout, Duration::from_secs(20));
        assert_eq!(config.store_retry.max_attempts, 3);
        assert_eq!(config.store_write_mode, StoreWriteMode::Upsert);
        assert!(config.max_external_calls.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn token_lists_ignore_blanks() {
        assert_eq!(parse_tokens(" hf_a, ,hf_b,"), vec!["hf_a", "hf_b"]);
        assert!(parse_tokens("").is_empty());
    }

    #[test]
    fn write_mode_parses_case_insensitively() {
        assert_eq!("REPLACE".parse::<StoreWriteMode>(), Ok(StoreWriteMode::Replace));
        assert!("merge".parse::<StoreWriteMode>().is_err());
    }
}
