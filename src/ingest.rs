use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::error::StartupError;
use crate::models::Report;

#[derive(Debug, Default)]
pub struct LoadedReports {
    pub reports: Vec<Report>,
    /// Non-blank input lines, parseable or not.
    pub total_records: usize,
    pub malformed: usize,
}

/// Outcome of the dual-classification gate for one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Confirmed,
    Rejected,
    /// The classifier flagged it but no generative validation exists yet.
    NeedsExtraction,
    /// No classifier payload at all.
    Malformed,
}

pub fn load_reports(path: &Path) -> Result<LoadedReports, StartupError> {
    if !path.exists() {
        return Err(StartupError::MissingInput(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| StartupError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let loaded = parse_reports(BufReader::new(file)).map_err(|source| StartupError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        path = %path.display(),
        reports = loaded.reports.len(),
        malformed = loaded.malformed,
        "Loaded reports"
    );
    Ok(loaded)
}

/// Parse JSON lines, skipping and counting records that do not decode.
///
/// Lines are split on raw bytes, so a line that is not valid UTF-8 is one
/// malformed record rather than a read error.
pub fn parse_reports<R: BufRead>(reader: R) -> std::io::Result<LoadedReports> {
    let mut loaded = LoadedReports::default();
    for (index, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        loaded.total_records += 1;
        match serde_json::from_slice::<Report>(&line) {
            Ok(report) => loaded.reports.push(report),
            Err(err) => {
                warn!(line = index + 1, error = %err, "Skipping malformed record");
                loaded.malformed += 1;
            }
        }
    }
    Ok(loaded)
}

pub fn gate(report: &Report) -> GateVerdict {
    let Some(ml) = &report.ml_classification else {
        return GateVerdict::Malformed;
    };
    if !ml.is_disaster {
        return GateVerdict::Rejected;
    }
    match &report.llm_extraction {
        None => GateVerdict::NeedsExtraction,
        Some(llm) if llm.confirmed => GateVerdict::Confirmed,
        Some(_) => GateVerdict::Rejected,
    }
}

/// Reports both the classifier and the generative validator call a disaster.
pub fn filter_confirmed(reports: &[Report]) -> Vec<Report> {
    reports
        .iter()
        .filter(|report| gate(report) == GateVerdict::Confirmed)
        .cloned()
        .collect()
}
