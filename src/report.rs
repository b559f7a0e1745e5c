use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{Incident, IncidentTypeSummary, RunMetadata, Severity};

pub fn summarize_by_type(incidents: &[Incident]) -> Vec<IncidentTypeSummary> {
    let mut map: HashMap<String, (usize, usize, Severity)> = HashMap::new();

    for incident in incidents {
        let entry = map
            .entry(incident.incident_type.clone())
            .or_insert((0, 0, Severity::Low));
        entry.0 += 1;
        entry.1 += incident.member_report_ids.len();
        if incident.severity.rank() > entry.2.rank() {
            entry.2 = incident.severity;
        }
    }

    let mut summaries: Vec<IncidentTypeSummary> = map
        .into_iter()
        .map(
            |(incident_type, (incident_count, report_count, max_severity))| IncidentTypeSummary {
                incident_type,
                incident_count,
                report_count,
                max_severity,
            },
        )
        .collect();

    summaries.sort_by(|a, b| {
        b.report_count
            .cmp(&a.report_count)
            .then_with(|| a.incident_type.cmp(&b.incident_type))
    });
    summaries
}

pub fn build_summary(metadata: &RunMetadata, incidents: &[Incident]) -> String {
    let summaries = summarize_by_type(incidents);

    let mut output = String::new();

    let _ = writeln!(output, "# Disaster Incident Run Summary");
    let _ = writeln!(
        output,
        "Run {} ({:?}) generated {}",
        metadata.run_id,
        metadata.status,
        metadata.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Counts");
    let _ = writeln!(output, "- Reports read: {}", metadata.total_reports);
    let _ = writeln!(output, "- Confirmed: {}", metadata.confirmed_reports);
    let _ = writeln!(output, "- Incidents created: {}", metadata.incidents_created);
    let _ = writeln!(
        output,
        "- Skipped: {} unresolved, {} already processed, {} rejected, {} malformed",
        metadata.skipped_unresolved,
        metadata.skipped_already_processed,
        metadata.rejected_by_gate,
        metadata.invalid_classification + metadata.malformed_records
    );
    let _ = writeln!(output, "- Failed: {}", metadata.failed);
    if metadata.quota_exhausted {
        let _ = writeln!(output, "- Quota exhausted before the run finished");
    }
    if metadata.store_write_failures > 0 {
        let _ = writeln!(
            output,
            "- Store write failures: {} (kept in the local artifact)",
            metadata.store_write_failures
        );
    }
    if metadata.gazetteer_write_failures > 0 {
        let _ = writeln!(
            output,
            "- Gazetteer write failures: {} (places will be geocoded again)",
            metadata.gazetteer_write_failures
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Incident Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No incidents created in this run.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} incidents from {} reports (max severity {})",
                summary.incident_type,
                summary.incident_count,
                summary.report_count,
                summary.max_severity
            );
        }
    }

    let mut ranked: Vec<&Incident> = incidents.iter().collect();
    ranked.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| b.member_report_ids.len().cmp(&a.member_report_ids.len()))
    });
    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Severity Incidents");

    if ranked.is_empty() {
        let _ = writeln!(output, "No incidents created in this run.");
    } else {
        for incident in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- [{}] {} at {} ({:.4}, {:.4}), {} reports",
                incident.severity,
                incident.title,
                incident.location,
                incident.centroid.lat,
                incident.centroid.lng,
                incident.member_report_ids.len()
            );
        }
    }

    if !metadata.credential_usage.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Credential Usage");
        for usage in &metadata.credential_usage {
            let _ = writeln!(
                output,
                "- {} {}: {} calls{}",
                usage.kind,
                usage.credential,
                usage.successful_calls,
                if usage.exhausted { " (exhausted)" } else { "" }
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::RunStatus;
    use crate::store::tests::incident;

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: "run-1".into(),
            status: RunStatus::Complete,
            total_reports: 12,
            confirmed_reports: 9,
            incidents_created: 3,
            skipped_unresolved: 1,
            skipped_already_processed: 0,
            rejected_by_gate: 2,
            invalid_classification: 0,
            malformed_records: 1,
            failed: 0,
            quota_exhausted: false,
            store_write_failures: 0,
            gazetteer_write_failures: 0,
            credential_usage: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn summary_groups_incidents_by_type() {
        let mut quake = incident("a", "Earthquake", 34.0, -118.0);
        quake.member_report_ids = vec!["1".into(), "2".into(), "3".into()];
        quake.severity = Severity::High;
        let flood = incident("b", "Flood", 39.4, -0.3);
        let mut second_flood = incident("c", "Flood", 45.0, 12.0);
        second_flood.severity = Severity::Low;

        let summaries = summarize_by_type(&[quake, flood, second_flood]);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].incident_type, "Earthquake");
        assert_eq!(summaries[0].report_count, 3);
        assert_eq!(summaries[0].max_severity, Severity::High);
        assert_eq!(summaries[1].incident_count, 2);
        assert_eq!(summaries[1].max_severity, Severity::Medium);
    }

    #[test]
    fn summary_lists_counts_and_top_incidents() {
        let mut quake = incident("a", "Earthquake", 34.0, -118.0);
        quake.severity = Severity::High;
        quake.title = "2 reports of Earthquake near Los Angeles".into();

        let text = build_summary(&metadata(), &[incident("b", "Flood", 0.0, 0.0), quake]);
        assert!(text.contains("- Incidents created: 3"));
        assert!(text.contains("2 rejected, 1 malformed"));
        assert!(text.contains("- Earthquake: 1 incidents from 1 reports (max severity high)"));
        let top = text
            .lines()
            .skip_while(|line| !line.starts_with("## Highest"))
            .nth(1)
            .unwrap();
        assert!(top.starts_with("- [high] 2 reports of Earthquake near Los Angeles"));
    }

    #[test]
    fn degraded_cache_is_called_out() {
        let mut metadata = metadata();
        metadata.gazetteer_write_failures = 2;
        let text = build_summary(&metadata, &[]);
        assert!(text.contains("- Gazetteer write failures: 2"));
    }

    #[test]
    fn empty_run_says_so() {
        let text = build_summary(&metadata(), &[]);
        assert!(text.contains("No incidents created in this run."));
        assert!(!text.contains("## Credential Usage"));
    }
}
