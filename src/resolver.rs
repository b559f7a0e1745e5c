use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::gateway::ApiGateway;
use crate::gazetteer::{Gazetteer, GazetteerEntry, DEFAULT_CONFIDENCE};
use crate::geo;
use crate::geocoder::Geocoder;
use crate::ingest;
use crate::models::{CredentialUsage, Report, ResolutionSource, ResolvedLocation};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedLocation),
    Unresolved(UnresolvedReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnresolvedReason {
    /// No coordinates in the text and no location hint to look up.
    NoLocation,
    /// The hint is unknown to the gazetteer and the geocoder found nothing.
    NoMatch,
    /// The geocoder failed after retries.
    GeocoderFailed(String),
    QuotaExhausted,
    CallCapReached,
}

/// Tiered location resolution: inline coordinates, then the gazetteer,
/// then the geocoder. Failures degrade to the next tier, never to an error.
pub struct LocationResolver {
    gazetteer: Gazetteer,
    geocoder: Option<Box<dyn Geocoder>>,
    gateway: ApiGateway,
    geocoder_calls: usize,
    gazetteer_write_failures: usize,
}

impl LocationResolver {
    pub fn new(gazetteer: Gazetteer, geocoder: Option<Box<dyn Geocoder>>, gateway: ApiGateway) -> Self {
        Self {
            gazetteer,
            geocoder,
            gateway,
            geocoder_calls: 0,
            gazetteer_write_failures: 0,
        }
    }

    pub async fn resolve(&mut self, report_text: &str, hint: Option<&str>) -> Resolution {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());

        if let Some(location) = self.resolve_inline(report_text, hint) {
            return Resolution::Resolved(location);
        }

        let Some(hint) = hint else {
            return Resolution::Unresolved(UnresolvedReason::NoLocation);
        };

        if let Some((place_id, entry)) = self.gazetteer.lookup(hint) {
            debug!(hint, place_id, "Resolved from gazetteer");
            return Resolution::Resolved(ResolvedLocation {
                query: hint.to_string(),
                canonical_name: entry.canonical_name.clone(),
                centroid: entry.centroid,
                source: ResolutionSource::Gazetteer,
                confidence: entry.confidence,
                first_seen: entry.first_seen,
            });
        }

        self.resolve_with_geocoder(hint).await
    }

    fn resolve_inline(&self, report_text: &str, hint: Option<&str>) -> Option<ResolvedLocation> {
        let (query, centroid) = geo::extract_inline_coordinates(report_text)
            .map(|c| (report_text, c))
            .or_else(|| hint.and_then(|h| geo::extract_inline_coordinates(h).map(|c| (h, c))))?;

        Some(ResolvedLocation {
            query: query.to_string(),
            canonical_name: hint.unwrap_or(query).to_string(),
            centroid,
            source: ResolutionSource::InlineCoords,
            confidence: 1.0,
            first_seen: Utc::now(),
        })
    }

    async fn resolve_with_geocoder(&mut self, hint: &str) -> Resolution {
        let Some(geocoder) = self.geocoder.as_deref() else {
            return Resolution::Unresolved(UnresolvedReason::NoMatch);
        };

        self.geocoder_calls += 1;
        let outcome = self
            .gateway
            .call_with_resilience(|token| async move { geocoder.geocode(&token, hint).await })
            .await;

        let hit = match outcome {
            Ok(Some(hit)) => hit,
            Ok(None) => return Resolution::Unresolved(UnresolvedReason::NoMatch),
            Err(GatewayError::QuotaExhausted) => {
                return Resolution::Unresolved(UnresolvedReason::QuotaExhausted)
            }
            Err(GatewayError::CallCapReached(_)) => {
                return Resolution::Unresolved(UnresolvedReason::CallCapReached)
            }
            Err(err) => {
                warn!(hint, error = %err, "Geocoding failed");
                return Resolution::Unresolved(UnresolvedReason::GeocoderFailed(err.to_string()));
            }
        };

        let first_seen = Utc::now();
        let entry = GazetteerEntry {
            canonical_name: hit.display_name.clone(),
            aliases: vec![hint.to_string()],
            centroid: hit.centroid,
            source: "geocoder".to_string(),
            confidence: DEFAULT_CONFIDENCE,
            first_seen,
        };
        match self.gazetteer.learn(&hit.place_id, entry) {
            Ok(()) => info!(hint, place_id = hit.place_id.as_str(), "Learned new place from geocoder"),
            Err(err) => {
                self.gazetteer_write_failures += 1;
                warn!(hint, place_id = hit.place_id.as_str(), error = %err, "Failed to persist gazetteer entry");
            }
        }

        Resolution::Resolved(ResolvedLocation {
            query: hint.to_string(),
            canonical_name: hit.display_name,
            centroid: hit.centroid,
            source: ResolutionSource::Geocoder,
            confidence: DEFAULT_CONFIDENCE,
            first_seen,
        })
    }

    pub fn gazetteer(&self) -> &Gazetteer {
        &self.gazetteer
    }

    pub fn geocoder_calls(&self) -> usize {
        self.geocoder_calls
    }

    /// Geocoder hits that are cached in memory only.
    pub fn gazetteer_write_failures(&self) -> usize {
        self.gazetteer_write_failures
    }

    pub fn usage(&self) -> Vec<CredentialUsage> {
        self.gateway.usage()
    }

    pub fn quota_exhausted(&self) -> bool {
        self.geocoder.is_some() && self.gateway.all_exhausted()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnrichSummary {
    pub candidates: usize,
    pub added: usize,
    pub failed: Vec<String>,
}

/// Pre-warm the gazetteer with location hints of confirmed reports that have
/// no inline coordinates and are not yet known, most frequent first.
pub async fn enrich_gazetteer(resolver: &mut LocationResolver, reports: &[Report]) -> EnrichSummary {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for report in ingest::filter_confirmed(reports) {
        let Some(hint) = report.location_hint() else {
            continue;
        };
        if geo::extract_inline_coordinates(&report.text).is_some()
            || geo::extract_inline_coordinates(hint).is_some()
            || resolver.gazetteer().lookup(hint).is_some()
        {
            continue;
        }
        *counts.entry(hint.to_string()).or_default() += 1;
    }

    let mut candidates: Vec<(String, usize)> = counts.into_iter().collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut summary = EnrichSummary {
        candidates: candidates.len(),
        ..EnrichSummary::default()
    };
    for (hint, count) in candidates {
        match resolver.resolve("", Some(&hint)).await {
            Resolution::Resolved(location) if location.source == ResolutionSource::Geocoder => {
                info!(hint = hint.as_str(), count, "Added gazetteer entry");
                summary.added += 1;
            }
            Resolution::Resolved(_) => {}
            Resolution::Unresolved(reason) => {
                warn!(hint = hint.as_str(), ?reason, "No gazetteer entry for hint");
                let halted = matches!(
                    reason,
                    UnresolvedReason::QuotaExhausted | UnresolvedReason::CallCapReached
                );
                summary.failed.push(hint);
                if halted {
                    break;
                }
            }
        }
    }
    summary
}
