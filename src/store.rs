use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::geo::haversine_km;
use crate::models::{Coordinates, Incident};

/// Downstream document store for incidents, keyed by incident id.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Insert or overwrite by id.
    async fn upsert(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Returns whether an incident was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError>;

    async fn query_near(&self, lat: f64, lng: f64, radius_km: f64) -> Result<Vec<Incident>, StoreError>;

    async fn query_by_type(&self, incident_type: &str) -> Result<Vec<Incident>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError>;

    /// Drop every stored incident and write `incidents` in their place.
    async fn replace_all(&self, incidents: &[Incident]) -> Result<(), StoreError>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryIncidentStore {
    incidents: RwLock<BTreeMap<String, Incident>>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.incidents.read().await.len()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn upsert(&self, incident: &Incident) -> Result<(), StoreError> {
        self.incidents
            .write()
            .await
            .insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.incidents.write().await.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        Ok(self.incidents.read().await.get(id).cloned())
    }

    async fn query_near(&self, lat: f64, lng: f64, radius_km: f64) -> Result<Vec<Incident>, StoreError> {
        let origin = Coordinates::new(lat, lng);
        Ok(within_radius(
            self.incidents.read().await.values().cloned(),
            origin,
            radius_km,
        ))
    }

    async fn query_by_type(&self, incident_type: &str) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .incidents
            .read()
            .await
            .values()
            .filter(|incident| incident.incident_type.eq_ignore_ascii_case(incident_type))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self.incidents.read().await.values().cloned().collect())
    }

    async fn replace_all(&self, incidents: &[Incident]) -> Result<(), StoreError> {
        let mut stored = self.incidents.write().await;
        stored.clear();
        stored.extend(incidents.iter().map(|i| (i.id.clone(), i.clone())));
        Ok(())
    }
}

/// Incidents within `radius_km` of `origin`, nearest first.
pub fn within_radius<I>(incidents: I, origin: Coordinates, radius_km: f64) -> Vec<Incident>
where
    I: IntoIterator<Item = Incident>,
{
    let mut hits: Vec<(f64, Incident)> = incidents
        .into_iter()
        .map(|incident| (haversine_km(origin, incident.centroid), incident))
        .filter(|(distance, _)| *distance <= radius_km)
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0));
    hits.into_iter().map(|(_, incident)| incident).collect()
}
