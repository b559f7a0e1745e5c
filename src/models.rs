use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Ordinal used for aggregation. High and critical share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High | Severity::Critical => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => Severity::Low,
            2 => Severity::Medium,
            _ => Severity::High,
        }
    }

    /// Unknown labels read as medium.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlClassification {
    pub is_disaster: bool,
    #[serde(default)]
    pub disaster_type: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmExtraction {
    #[serde(default, alias = "llm_classification", deserialize_with = "null_as_false")]
    pub confirmed: bool,
    #[serde(default)]
    pub disaster_type: Option<String>,
    #[serde(default, alias = "location")]
    pub location_text: Option<String>,
    #[serde(default, alias = "time")]
    pub time_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_severity")]
    pub severity: Severity,
    #[serde(default, deserialize_with = "null_as_false")]
    pub casualties_mentioned: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub damage_mentioned: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub needs_help: bool,
    #[serde(default)]
    pub key_details: Option<String>,
}

/// One upstream-classified social post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub text: String,
    #[serde(default, deserialize_with = "author_handle")]
    pub author: String,
    #[serde(rename = "createdAt", alias = "timestamp", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ml_classification: Option<MlClassification>,
    #[serde(default)]
    pub llm_extraction: Option<LlmExtraction>,
}

impl Report {
    pub fn with_extraction(&self, extraction: LlmExtraction) -> Report {
        Report {
            llm_extraction: Some(extraction),
            ..self.clone()
        }
    }

    /// Structured location text produced by the extraction stage, if any.
    pub fn location_hint(&self) -> Option<&str> {
        self.llm_extraction
            .as_ref()
            .and_then(|llm| llm.location_text.as_deref())
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
    }

    pub fn severity(&self) -> Severity {
        self.llm_extraction
            .as_ref()
            .map(|llm| llm.severity)
            .unwrap_or_default()
    }

    /// Display family of the disaster; the extraction's type wins over the classifier's.
    pub fn incident_type(&self) -> String {
        let raw = self
            .llm_extraction
            .as_ref()
            .and_then(|llm| llm.disaster_type.as_deref())
            .or_else(|| {
                self.ml_classification
                    .as_ref()
                    .and_then(|ml| ml.disaster_type.as_deref())
            })
            .unwrap_or("unknown");
        normalize_disaster_type(raw)
    }

    pub fn derived_title(&self) -> String {
        let key_details = self
            .llm_extraction
            .as_ref()
            .and_then(|llm| llm.key_details.as_deref())
            .map(str::trim)
            .filter(|details| !details.is_empty());

        match key_details {
            Some(details) => details.chars().take(80).collect(),
            None => {
                let snippet: String = self.text.chars().take(100).collect();
                if self.text.chars().count() > 100 {
                    format!("{snippet}...")
                } else {
                    snippet
                }
            }
        }
    }

    pub fn derived_description(&self) -> String {
        self.llm_extraction
            .as_ref()
            .and_then(|llm| llm.key_details.clone())
            .filter(|details| !details.trim().is_empty())
            .unwrap_or_else(|| self.text.clone())
    }

    /// Location label for display, with any trailing coordinate group removed.
    pub fn display_location(&self) -> String {
        match self.location_hint() {
            Some(hint) => hint.split('(').next().unwrap_or(hint).trim().to_string(),
            None => "Unknown location".to_string(),
        }
    }
}

pub fn normalize_disaster_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let family = match lowered.as_str() {
        "earthquake" => "Earthquake",
        "flood" | "tsunami" => "Flood",
        "hurricane" | "storm" | "typhoon" | "cyclone" => "Storm",
        "wildfire" => "Wildfire",
        "tornado" => "Tornado",
        "avalanche" => "Avalanche",
        "landslide" => "Landslide",
        "volcano" | "volcanic" => "Volcano",
        "drought" => "Drought",
        "heatwave" => "Heatwave",
        "coldwave" => "Coldwave",
        "" => "Unknown",
        _ => {
            let mut chars = lowered.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Unknown".to_string(),
            };
        }
    };
    family.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    InlineCoords,
    Gazetteer,
    Geocoder,
}

impl ResolutionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionSource::InlineCoords => "inline_coords",
            ResolutionSource::Gazetteer => "gazetteer",
            ResolutionSource::Geocoder => "geocoder",
        }
    }
}

impl FromStr for ResolutionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline_coords" => Ok(ResolutionSource::InlineCoords),
            "gazetteer" => Ok(ResolutionSource::Gazetteer),
            "geocoder" => Ok(ResolutionSource::Geocoder),
            other => Err(format!("unknown resolution source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub query: String,
    pub canonical_name: String,
    pub centroid: Coordinates,
    pub source: ResolutionSource,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
}

/// A confirmed report paired with its resolved coordinates.
#[derive(Debug, Clone)]
pub struct ResolvedReport {
    pub report: Report,
    pub location: ResolvedLocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    Active,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IncidentStatus::Active),
            "resolved" => Ok(IncidentStatus::Resolved),
            "closed" => Ok(IncidentStatus::Closed),
            other => Err(format!("unknown incident status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub incident_type: String,
    pub title: String,
    pub description: String,
    pub location: String,
    pub centroid: Coordinates,
    pub severity: Severity,
    pub member_report_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub casualties_mentioned: bool,
    pub damage_mentioned: bool,
    pub needs_help: bool,
    pub resolved_source: ResolutionSource,
    pub resolved_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Partial,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub kind: String,
    pub credential: String,
    pub successful_calls: usize,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: RunStatus,
    pub total_reports: usize,
    pub confirmed_reports: usize,
    pub incidents_created: usize,
    pub skipped_unresolved: usize,
    pub skipped_already_processed: usize,
    pub rejected_by_gate: usize,
    pub invalid_classification: usize,
    pub malformed_records: usize,
    pub failed: usize,
    pub quota_exhausted: bool,
    pub store_write_failures: usize,
    /// Places resolved by the geocoder that could not be written to the gazetteer.
    #[serde(default)]
    pub gazetteer_write_failures: usize,
    pub credential_usage: Vec<CredentialUsage>,
    pub generated_at: DateTime<Utc>,
}

/// The local artifact written after every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub metadata: RunMetadata,
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Clone)]
pub struct IncidentTypeSummary {
    pub incident_type: String,
    pub incident_count: usize,
    pub report_count: usize,
    pub max_severity: Severity,
}

fn lenient_severity<'de, D>(deserializer: D) -> Result<Severity, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|value| Severity::parse_lenient(&value))
        .unwrap_or_default())
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

fn author_handle<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Author {
        Handle(String),
        Profile { handle: String },
    }

    Ok(match Option::<Author>::deserialize(deserializer)? {
        Some(Author::Handle(handle)) | Some(Author::Profile { handle }) => handle,
        None => String::new(),
    })
}
