use uuid::Uuid;

use crate::geo::haversine_km;
use crate::models::{
    Coordinates, Incident, IncidentStatus, LlmExtraction, ResolvedReport, Severity,
};

pub const DEFAULT_THRESHOLD_KM: f64 = 50.0;

/// Namespace for deterministic incident ids.
const INCIDENT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_4d2e_9a7b_4f3c_8e21_5b0d_a4c7_e913);

struct OpenCluster<'a> {
    incident_type: String,
    centroid: Coordinates,
    members: Vec<&'a ResolvedReport>,
}

impl<'a> OpenCluster<'a> {
    fn push(&mut self, member: &'a ResolvedReport) {
        self.members.push(member);
        let n = self.members.len() as f64;
        let (lat_sum, lng_sum) = self.members.iter().fold((0.0, 0.0), |(lat, lng), m| {
            (lat + m.location.centroid.lat, lng + m.location.centroid.lng)
        });
        self.centroid = Coordinates::new(lat_sum / n, lng_sum / n);
    }
}

/// Greedy single-pass clustering in input order.
///
/// Each report joins the nearest open cluster of the same incident type whose
/// centroid is within `threshold_km`, or opens a new one. The result depends
/// on input order.
pub fn cluster(reports: &[ResolvedReport], threshold_km: f64) -> Vec<Incident> {
    let mut clusters: Vec<OpenCluster> = Vec::new();

    for resolved in reports {
        let incident_type = resolved.report.incident_type();
        let point = resolved.location.centroid;

        let nearest = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.incident_type == incident_type)
            .map(|(idx, c)| (idx, haversine_km(c.centroid, point)))
            .fold(None::<(usize, f64)>, |best, (idx, distance)| match best {
                Some((_, best_distance)) if best_distance <= distance => best,
                _ => Some((idx, distance)),
            });

        match nearest {
            Some((idx, distance)) if distance <= threshold_km => clusters[idx].push(resolved),
            _ => clusters.push(OpenCluster {
                incident_type,
                centroid: point,
                members: vec![resolved],
            }),
        }
    }

    clusters.into_iter().filter_map(finish).collect()
}

fn finish(cluster: OpenCluster) -> Option<Incident> {
    let first = cluster.members.first()?;
    let location = first.report.display_location();

    let member_report_ids: Vec<String> = cluster
        .members
        .iter()
        .map(|m| m.report.id.clone())
        .collect();
    let id = incident_id(&location, &member_report_ids);
    let created_at = cluster
        .members
        .iter()
        .map(|m| m.report.created_at)
        .min()
        .unwrap_or(first.report.created_at);
    let flagged = |pick: fn(&LlmExtraction) -> bool| {
        cluster
            .members
            .iter()
            .any(|m| m.report.llm_extraction.as_ref().is_some_and(pick))
    };

    let (title, description, severity) = if cluster.members.len() == 1 {
        (
            first.report.derived_title(),
            first.report.derived_description(),
            first.report.severity(),
        )
    } else {
        let summary = format!(
            "{} reports of {} near {}",
            cluster.members.len(),
            cluster.incident_type,
            location
        );
        let severity = aggregate_severity(cluster.members.iter().map(|m| m.report.severity()));
        (summary.clone(), summary, severity)
    };

    Some(Incident {
        id,
        incident_type: cluster.incident_type.clone(),
        title,
        description,
        location,
        centroid: cluster.centroid,
        severity,
        member_report_ids,
        created_at,
        status: IncidentStatus::Active,
        casualties_mentioned: flagged(|l| l.casualties_mentioned),
        damage_mentioned: flagged(|l| l.damage_mentioned),
        needs_help: flagged(|l| l.needs_help),
        resolved_source: first.location.source,
        resolved_confidence: first.location.confidence,
    })
}

/// Highest rank wins; high and critical both render as high.
pub fn aggregate_severity<I: IntoIterator<Item = Severity>>(severities: I) -> Severity {
    let max_rank = severities
        .into_iter()
        .map(Severity::rank)
        .max()
        .unwrap_or(Severity::Medium.rank());
    Severity::from_rank(max_rank)
}

/// Stable id for the same members at the same location, whatever their order.
pub fn incident_id(location: &str, member_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let key = format!("{}|{}", location.trim().to_lowercase(), sorted.join(","));
    Uuid::new_v5(&INCIDENT_NAMESPACE, key.as_bytes()).to_string()
}
