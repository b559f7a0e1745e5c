//! Checkpointed batch loop driving reports from the gate to the incident store.
//!
//! A run walks every new report through gate, extraction, and location
//! resolution in input order, clusters what resolved once at the end, writes
//! the local artifact, then the store, and only then grows the checkpoint.
//! Members of an incident the store did not accept stay out of the
//! checkpoint, so a later run rebuilds and writes it again.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic;
use crate::checkpoint::ProcessingCheckpoint;
use crate::cluster;
use crate::config::{PipelineConfig, StoreWriteMode};
use crate::error::{GatewayError, StoreError};
use crate::extractor::ExtractionStage;
use crate::ingest::{self, GateVerdict, LoadedReports};
use crate::models::{
    CredentialUsage, Incident, Report, ResolvedReport, RunArtifact, RunMetadata, RunStatus,
};
use crate::resolver::{LocationResolver, Resolution, UnresolvedReason};
use crate::store::IncidentStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ReportState {
    Pending,
    Classified,
    Resolved,
    Clustered,
    Persisted,
    Skipped(SkipReason),
    Failed(FailReason),
}

impl ReportState {
    /// Whether the report should never be looked at again.
    fn is_settled(&self) -> bool {
        matches!(
            self,
            ReportState::Persisted
                | ReportState::Skipped(
                    SkipReason::GateRejected | SkipReason::MalformedPayload | SkipReason::Unresolved
                )
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyProcessed,
    GateRejected,
    MalformedPayload,
    /// No location could be found for the report.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    Quota,
    CallCap,
    Extraction(String),
    /// The report needs generative extraction but none is configured.
    ExtractionUnavailable,
    Geocoder(String),
    Cancelled,
    /// Clustered, but the incident only reached the local artifact.
    StoreWrite,
}

/// Set once on interrupt; checked before each batch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn install_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                flag.cancel();
            }
        });
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub artifact: RunArtifact,
    pub states: BTreeMap<String, ReportState>,
}

pub struct BatchOrchestrator {
    config: PipelineConfig,
    resolver: LocationResolver,
    extraction: Option<ExtractionStage>,
    store: Arc<dyn IncidentStore>,
    checkpoint: ProcessingCheckpoint,
    cancel: CancelFlag,
}

impl BatchOrchestrator {
    pub fn new(
        config: PipelineConfig,
        resolver: LocationResolver,
        extraction: Option<ExtractionStage>,
        store: Arc<dyn IncidentStore>,
        checkpoint: ProcessingCheckpoint,
    ) -> Self {
        Self {
            config,
            resolver,
            extraction,
            store,
            checkpoint,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn checkpoint(&self) -> &ProcessingCheckpoint {
        &self.checkpoint
    }

    pub async fn run(&mut self, loaded: LoadedReports) -> anyhow::Result<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let mut metadata = RunMetadata {
            run_id: run_id.clone(),
            status: RunStatus::Complete,
            total_reports: loaded.total_records,
            confirmed_reports: 0,
            incidents_created: 0,
            skipped_unresolved: 0,
            skipped_already_processed: 0,
            rejected_by_gate: 0,
            invalid_classification: 0,
            malformed_records: loaded.malformed,
            failed: 0,
            quota_exhausted: false,
            store_write_failures: 0,
            gazetteer_write_failures: 0,
            credential_usage: Vec::new(),
            generated_at: Utc::now(),
        };

        let mut states: BTreeMap<String, ReportState> = BTreeMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&Report> = Vec::new();
        for report in &loaded.reports {
            if self.checkpoint.contains(&report.id) || !seen.insert(report.id.as_str()) {
                metadata.skipped_already_processed += 1;
                states
                    .entry(report.id.clone())
                    .or_insert(ReportState::Skipped(SkipReason::AlreadyProcessed));
                continue;
            }
            states.insert(report.id.clone(), ReportState::Pending);
            pending.push(report);
        }
        info!(
            run_id = run_id.as_str(),
            new = pending.len(),
            already_processed = metadata.skipped_already_processed,
            "Starting run"
        );

        let batch_size = self.config.batch_size.max(1);
        let batch_count = pending.len().div_ceil(batch_size);
        let mut resolved: Vec<ResolvedReport> = Vec::new();

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            if self.cancel.is_cancelled() {
                warn!(batch = index + 1, of = batch_count, "Run cancelled before batch");
                metadata.status = RunStatus::Cancelled;
                break;
            }
            info!(batch = index + 1, of = batch_count, size = batch.len(), "Processing batch");

            for report in batch {
                let (state, outcome) = self.process_report(report, &mut metadata).await;
                if let Some(outcome) = outcome {
                    resolved.push(outcome);
                }
                states.insert(report.id.clone(), state);
            }
        }

        for state in states.values_mut() {
            if *state == ReportState::Pending {
                *state = ReportState::Failed(FailReason::Cancelled);
            }
        }

        let incidents = cluster::cluster(&resolved, self.config.distance_threshold_km);
        for member in &resolved {
            states.insert(member.report.id.clone(), ReportState::Clustered);
        }
        info!(
            resolved = resolved.len(),
            incidents = incidents.len(),
            "Clustered resolved reports"
        );

        metadata.incidents_created = incidents.len();
        metadata.failed = states
            .values()
            .filter(|state| matches!(state, ReportState::Failed(_)))
            .count();
        metadata.quota_exhausted = self.resolver.quota_exhausted()
            || self
                .extraction
                .as_ref()
                .is_some_and(ExtractionStage::quota_exhausted);
        metadata.gazetteer_write_failures = self.resolver.gazetteer_write_failures();
        metadata.credential_usage = self.credential_usage();

        let mut artifact = RunArtifact {
            metadata,
            incidents,
        };
        self.write_artifact(&artifact)?;

        let unwritten = self.write_to_store(&artifact.incidents).await;
        artifact.metadata.store_write_failures = unwritten.len();
        if artifact.metadata.status != RunStatus::Cancelled
            && (artifact.metadata.failed > 0 || artifact.metadata.store_write_failures > 0)
        {
            artifact.metadata.status = RunStatus::Partial;
        }
        artifact.metadata.generated_at = Utc::now();
        self.write_artifact(&artifact)?;

        for incident in &artifact.incidents {
            let state = if unwritten.contains(&incident.id) {
                ReportState::Failed(FailReason::StoreWrite)
            } else {
                ReportState::Persisted
            };
            for member in &incident.member_report_ids {
                states.insert(member.clone(), state.clone());
            }
        }
        self.checkpoint.record(
            states
                .iter()
                .filter(|(_, state)| state.is_settled())
                .map(|(id, _)| id.clone()),
        );
        self.checkpoint.mark_run(artifact.metadata.generated_at);
        self.checkpoint
            .save(&self.config.checkpoint)
            .with_context(|| format!("failed to save checkpoint {}", self.config.checkpoint.display()))?;

        info!(
            run_id = run_id.as_str(),
            status = ?artifact.metadata.status,
            incidents = artifact.metadata.incidents_created,
            failed = artifact.metadata.failed,
            store_write_failures = artifact.metadata.store_write_failures,
            "Run finished"
        );

        Ok(RunOutcome { artifact, states })
    }

    async fn process_report(
        &mut self,
        report: &Report,
        metadata: &mut RunMetadata,
    ) -> (ReportState, Option<ResolvedReport>) {
        let confirmed = match ingest::gate(report) {
            GateVerdict::Confirmed => report.clone(),
            GateVerdict::Rejected => {
                metadata.rejected_by_gate += 1;
                return (ReportState::Skipped(SkipReason::GateRejected), None);
            }
            GateVerdict::Malformed => {
                metadata.invalid_classification += 1;
                return (ReportState::Skipped(SkipReason::MalformedPayload), None);
            }
            GateVerdict::NeedsExtraction => match self.extract(report).await {
                Ok(enriched) if ingest::gate(&enriched) == GateVerdict::Confirmed => enriched,
                Ok(_) => {
                    metadata.rejected_by_gate += 1;
                    return (ReportState::Skipped(SkipReason::GateRejected), None);
                }
                Err(reason) => return (ReportState::Failed(reason), None),
            },
        };
        metadata.confirmed_reports += 1;
        debug!(report_id = confirmed.id.as_str(), state = ?ReportState::Classified, "Report confirmed");

        let resolution = self
            .resolver
            .resolve(&confirmed.text, confirmed.location_hint())
            .await;

        match resolution {
            Resolution::Resolved(location) => (
                ReportState::Resolved,
                Some(ResolvedReport {
                    report: confirmed,
                    location,
                }),
            ),
            Resolution::Unresolved(UnresolvedReason::NoLocation | UnresolvedReason::NoMatch) => {
                metadata.skipped_unresolved += 1;
                debug!(report_id = confirmed.id.as_str(), "No location for report");
                (ReportState::Skipped(SkipReason::Unresolved), None)
            }
            Resolution::Unresolved(UnresolvedReason::QuotaExhausted) => {
                (ReportState::Failed(FailReason::Quota), None)
            }
            Resolution::Unresolved(UnresolvedReason::CallCapReached) => {
                (ReportState::Failed(FailReason::CallCap), None)
            }
            Resolution::Unresolved(UnresolvedReason::GeocoderFailed(reason)) => {
                (ReportState::Failed(FailReason::Geocoder(reason)), None)
            }
        }
    }

    async fn extract(&mut self, report: &Report) -> Result<Report, FailReason> {
        let Some(stage) = self.extraction.as_mut() else {
            return Err(FailReason::ExtractionUnavailable);
        };
        match stage.extract(report).await {
            Ok(extraction) => Ok(report.with_extraction(extraction)),
            Err(GatewayError::QuotaExhausted) => Err(FailReason::Quota),
            Err(GatewayError::CallCapReached(_)) => Err(FailReason::CallCap),
            Err(err) => {
                warn!(report_id = report.id.as_str(), error = %err, "Extraction failed");
                Err(FailReason::Extraction(err.to_string()))
            }
        }
    }

    fn credential_usage(&self) -> Vec<CredentialUsage> {
        let mut usage = self
            .extraction
            .as_ref()
            .map(ExtractionStage::usage)
            .unwrap_or_default();
        usage.extend(self.resolver.usage());
        usage
    }

    fn write_artifact(&self, artifact: &RunArtifact) -> anyhow::Result<()> {
        atomic::write_json(&self.config.output, artifact).with_context(|| {
            format!("failed to write artifact {}", self.config.output.display())
        })
    }

    /// Returns the ids of incidents that only reached the local artifact.
    async fn write_to_store(&self, incidents: &[Incident]) -> HashSet<String> {
        let store = self.store.as_ref();
        let retry = &self.config.store_retry;
        let all_ids = || -> HashSet<String> { incidents.iter().map(|i| i.id.clone()).collect() };

        match self.config.store_write_mode {
            StoreWriteMode::Upsert => {
                let mut unwritten = HashSet::new();
                for incident in incidents {
                    let result = retry
                        .run("store upsert", StoreError::is_retryable, || store.upsert(incident))
                        .await;
                    if let Err(err) = result {
                        warn!(
                            incident_id = incident.id.as_str(),
                            error = %err,
                            "Store write failed, incident kept locally"
                        );
                        unwritten.insert(incident.id.clone());
                    }
                }
                info!(
                    written = incidents.len() - unwritten.len(),
                    failed = unwritten.len(),
                    "Upserted incidents"
                );
                unwritten
            }
            StoreWriteMode::Replace if incidents.is_empty() => {
                info!("No new incidents, store contents left in place");
                HashSet::new()
            }
            StoreWriteMode::Replace => {
                let stored = match retry
                    .run("store read", StoreError::is_retryable, || store.list_all())
                    .await
                {
                    Ok(stored) => stored,
                    Err(err) => {
                        warn!(error = %err, "Store read failed, incidents kept locally");
                        return all_ids();
                    }
                };
                let merged = merge_by_id(stored, incidents);
                let result = retry
                    .run("store replace", StoreError::is_retryable, || {
                        store.replace_all(&merged)
                    })
                    .await;
                match result {
                    Ok(()) => {
                        info!(
                            written = incidents.len(),
                            total = merged.len(),
                            "Replaced store contents"
                        );
                        HashSet::new()
                    }
                    Err(err) => {
                        warn!(error = %err, "Store replace failed, incidents kept locally");
                        all_ids()
                    }
                }
            }
        }
    }
}

/// Stored incidents with this run's incidents laid over them by id.
fn merge_by_id(stored: Vec<Incident>, incidents: &[Incident]) -> Vec<Incident> {
    let mut merged: BTreeMap<String, Incident> = stored
        .into_iter()
        .map(|incident| (incident.id.clone(), incident))
        .collect();
    for incident in incidents {
        merged.insert(incident.id.clone(), incident.clone());
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::extractor::tests::FakeExtractor;
    use crate::gateway::{ApiGateway, CallBudget, CallKind};
    use crate::gazetteer::Gazetteer;
    use crate::resolver::tests::resolver_with;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryIncidentStore;

    fn config_in(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            input: dir.join("reports.jsonl"),
            output: dir.join("incidents.json"),
            checkpoint: dir.join("processed_ids.json"),
            gazetteer: dir.join("location_db.json"),
            batch_size: 2,
            batch_delay: Duration::ZERO,
            store_retry: RetryPolicy::new(2, Duration::ZERO),
            ..PipelineConfig::default()
        }
    }

    fn record(id: &str, text: &str, ml: bool, extraction: Option<(bool, &str)>) -> String {
        let mut value = json!({
            "id": id,
            "text": text,
            "author": "watcher",
            "createdAt": "2025-02-01T10:00:00Z",
            "ml_classification": {"is_disaster": ml, "disaster_type": "earthquake", "confidence": 0.91},
        });
        if let Some((confirmed, location)) = extraction {
            value["llm_extraction"] = json!({
                "llm_classification": confirmed,
                "disaster_type": "earthquake",
                "location": location,
                "severity": "high",
                "key_details": format!("Shaking reported ({id})"),
            });
        }
        value.to_string()
    }

    fn loaded(lines: &[String]) -> LoadedReports {
        ingest::parse_reports(lines.join("\n").as_bytes()).unwrap()
    }

    fn extraction_stage(fake: FakeExtractor, tokens: &[&str]) -> ExtractionStage {
        ExtractionStage::new(
            Box::new(fake),
            ApiGateway::new(
                CallKind::Extraction,
                tokens.iter().map(|t| t.to_string()).collect(),
                RetryPolicy::no_retry(),
                CallBudget::unlimited(),
            ),
        )
    }

    fn orchestrator(
        config: PipelineConfig,
        extraction: Option<ExtractionStage>,
        store: Arc<dyn IncidentStore>,
    ) -> BatchOrchestrator {
        let checkpoint = ProcessingCheckpoint::load(&config.checkpoint).unwrap();
        BatchOrchestrator::new(
            config,
            resolver_with(Gazetteer::in_memory(), None),
            extraction,
            store,
            checkpoint,
        )
    }

    /// Store that is never reachable.
    struct UnreachableStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl IncidentStore for UnreachableStore {
        async fn upsert(&self, _incident: &Incident) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn get(&self, _id: &str) -> Result<Option<Incident>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn query_near(&self, _lat: f64, _lng: f64, _radius_km: f64) -> Result<Vec<Incident>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn query_by_type(&self, _incident_type: &str) -> Result<Vec<Incident>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn replace_all(&self, _incidents: &[Incident]) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn second_run_over_same_input_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIncidentStore::new());
        let input = vec![
            record("1", "Strong shaking", true, Some((true, "Tokyo, Japan (35.6762, 139.6503)"))),
            record("2", "Still shaking", true, Some((true, "Tokyo (35.70, 139.70)"))),
            record("3", "Quake downtown", true, Some((true, "Los Angeles (34.05, -118.24)"))),
            record("4", "Earthquake sale at the mall", false, None),
            record("5", "Something happened", true, Some((true, "somewhere vague"))),
        ];

        let mut first = orchestrator(config_in(dir.path()), None, store.clone());
        let outcome = first.run(loaded(&input)).await.unwrap();
        let metadata = &outcome.artifact.metadata;
        assert_eq!(metadata.total_reports, 5);
        assert_eq!(metadata.confirmed_reports, 4);
        assert_eq!(metadata.incidents_created, 2);
        assert_eq!(metadata.rejected_by_gate, 1);
        assert_eq!(metadata.skipped_unresolved, 1);
        assert_eq!(metadata.status, RunStatus::Complete);
        assert_eq!(outcome.states["1"], ReportState::Persisted);
        assert_eq!(store.len().await, 2);
        let stored_before = store.query_near(35.6762, 139.6503, 10.0).await.unwrap();

        let mut second = orchestrator(config_in(dir.path()), None, store.clone());
        let rerun = second.run(loaded(&input)).await.unwrap();
        assert_eq!(rerun.artifact.metadata.skipped_already_processed, 5);
        assert_eq!(rerun.artifact.metadata.incidents_created, 0);
        assert!(rerun
            .states
            .values()
            .all(|state| *state == ReportState::Skipped(SkipReason::AlreadyProcessed)));
        assert_eq!(store.len().await, 2);
        assert_eq!(store.query_near(35.6762, 139.6503, 10.0).await.unwrap(), stored_before);
    }

    #[tokio::test]
    async fn quota_exhaustion_still_writes_a_valid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let output = config.output.clone();
        let checkpoint_path = config.checkpoint.clone();
        let fake = FakeExtractor {
            quota_after: Some(2),
            location: "Valencia, Spain (39.47, -0.38)".into(),
            ..FakeExtractor::default()
        };
        let input: Vec<String> = (1..=5)
            .map(|n| record(&n.to_string(), "Water everywhere", true, None))
            .collect();

        let mut orchestrator = orchestrator(
            config,
            Some(extraction_stage(fake.clone(), &["hf_only"])),
            Arc::new(MemoryIncidentStore::new()),
        );
        let outcome = orchestrator.run(loaded(&input)).await.unwrap();

        let metadata = &outcome.artifact.metadata;
        assert_eq!(metadata.failed, 3);
        assert!(metadata.quota_exhausted);
        assert_eq!(metadata.status, RunStatus::Partial);
        assert_eq!(metadata.incidents_created, 1);
        assert_eq!(outcome.states["5"], ReportState::Failed(FailReason::Quota));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);

        let written: RunArtifact = atomic::read_json(&output).unwrap().unwrap();
        assert_eq!(written.metadata, outcome.artifact.metadata);
        assert_eq!(written.incidents.len(), 1);

        let checkpoint = ProcessingCheckpoint::load(&checkpoint_path).unwrap();
        assert!(checkpoint.contains("1") && checkpoint.contains("2"));
        assert!(!checkpoint.contains("3"));
    }

    #[tokio::test]
    async fn quota_on_first_token_rotates_to_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            quota_after: Some(4),
            location: "Quito, Ecuador (-0.18, -78.47)".into(),
            ..FakeExtractor::default()
        };
        let input: Vec<String> = (1..=6)
            .map(|n| record(&format!("r{n}"), "Ash falling", true, None))
            .collect();

        let mut orchestrator = orchestrator(
            config_in(dir.path()),
            Some(extraction_stage(fake, &["hf_aaaa", "hf_bbbb"])),
            Arc::new(MemoryIncidentStore::new()),
        );
        let outcome = orchestrator.run(loaded(&input)).await.unwrap();

        let metadata = &outcome.artifact.metadata;
        assert_eq!(metadata.failed, 0);
        assert_eq!(metadata.status, RunStatus::Complete);
        assert_eq!(metadata.incidents_created, 1);
        assert_eq!(outcome.artifact.incidents[0].member_report_ids.len(), 6);

        let extraction: Vec<_> = metadata
            .credential_usage
            .iter()
            .filter(|usage| usage.kind == "extraction")
            .collect();
        assert_eq!(extraction[0].successful_calls, 4);
        assert!(extraction[0].exhausted);
        assert_eq!(extraction[1].successful_calls, 2);
        assert!(!extraction[1].exhausted);
    }

    #[tokio::test]
    async fn unreachable_store_falls_back_to_local_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(UnreachableStore {
            attempts: AtomicUsize::new(0),
        });
        let input = vec![record("1", "Shaking", true, Some((true, "Lima (-12.05, -77.04)")))];

        let mut orchestrator = orchestrator(config_in(dir.path()), None, store.clone());
        let outcome = orchestrator.run(loaded(&input)).await.unwrap();

        assert_eq!(outcome.artifact.metadata.store_write_failures, 1);
        assert_eq!(outcome.artifact.metadata.status, RunStatus::Partial);
        assert_eq!(outcome.artifact.incidents.len(), 1);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.states["1"], ReportState::Failed(FailReason::StoreWrite));
        assert!(!orchestrator.checkpoint().contains("1"));
    }

    #[tokio::test]
    async fn incident_missed_by_the_store_is_written_on_the_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let lima = record("1", "Shaking", true, Some((true, "Lima (-12.05, -77.04)")));
        let tokyo = record("3", "Shaking", true, Some((true, "Tokyo (35.68, 139.65)")));

        let mut first = orchestrator(
            config_in(dir.path()),
            None,
            Arc::new(UnreachableStore {
                attempts: AtomicUsize::new(0),
            }),
        );
        let missed = first.run(loaded(&[lima.clone()])).await.unwrap();
        let lima_id = missed.artifact.incidents[0].id.clone();

        let store = Arc::new(MemoryIncidentStore::new());
        let mut second = orchestrator(config_in(dir.path()), None, store.clone());
        let outcome = second.run(loaded(&[lima, tokyo])).await.unwrap();

        assert_eq!(outcome.artifact.metadata.skipped_already_processed, 0);
        assert_eq!(outcome.artifact.metadata.status, RunStatus::Complete);
        assert!(store.get(&lima_id).await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
        assert!(second.checkpoint().contains("1") && second.checkpoint().contains("3"));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_reports_unchecked() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let output = config.output.clone();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let input = vec![
            record("1", "Shaking", true, Some((true, "Lima (-12.05, -77.04)"))),
            record("2", "More shaking", true, Some((true, "Lima (-12.05, -77.04)"))),
        ];

        let mut orchestrator =
            orchestrator(config, None, Arc::new(MemoryIncidentStore::new())).with_cancel(cancel);
        let outcome = orchestrator.run(loaded(&input)).await.unwrap();

        assert_eq!(outcome.artifact.metadata.status, RunStatus::Cancelled);
        assert_eq!(outcome.artifact.metadata.failed, 2);
        assert_eq!(outcome.states["2"], ReportState::Failed(FailReason::Cancelled));
        assert_eq!(orchestrator.checkpoint().len(), 0);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn replace_mode_keeps_incidents_from_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIncidentStore::new());
        store
            .upsert(&crate::store::tests::incident("earlier", "Flood", 1.0, 1.0))
            .await
            .unwrap();
        let config = || PipelineConfig {
            store_write_mode: StoreWriteMode::Replace,
            ..config_in(dir.path())
        };
        let lima = record("1", "Shaking", true, Some((true, "Lima (-12.05, -77.04)")));
        let tokyo = record("2", "Shaking", true, Some((true, "Tokyo (35.68, 139.65)")));

        let mut first = orchestrator(config(), None, store.clone());
        let lima_id = first.run(loaded(&[lima.clone()])).await.unwrap().artifact.incidents[0]
            .id
            .clone();

        let mut second = orchestrator(config(), None, store.clone());
        let outcome = second.run(loaded(&[lima, tokyo])).await.unwrap();

        assert_eq!(outcome.artifact.metadata.skipped_already_processed, 1);
        assert_eq!(outcome.artifact.incidents.len(), 1);
        assert!(store.get("earlier").await.unwrap().is_some());
        assert!(store.get(&lima_id).await.unwrap().is_some());
        assert!(store
            .get(&outcome.artifact.incidents[0].id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn missing_extraction_keeps_reports_for_a_later_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = vec![record("1", "Flooding on main street", true, None)];

        let mut orchestrator =
            orchestrator(config_in(dir.path()), None, Arc::new(MemoryIncidentStore::new()));
        let outcome = orchestrator.run(loaded(&input)).await.unwrap();

        assert_eq!(
            outcome.states["1"],
            ReportState::Failed(FailReason::ExtractionUnavailable)
        );
        assert!(!orchestrator.checkpoint().contains("1"));
    }
}
