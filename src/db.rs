use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::StoreError;
use crate::models::{Coordinates, Incident, IncidentStatus, ResolutionSource, Severity};
use crate::store::{self, IncidentStore};

/// Kilometres per degree of latitude, for the radius query prefilter.
const KM_PER_DEGREE_LAT: f64 = 111.0;

const SELECT_INCIDENTS: &str = "SELECT id, incident_type, title, description, location, lat, lng, \
     severity, member_report_ids, created_at, status, casualties_mentioned, damage_mentioned, \
     needs_help, resolved_source, resolved_confidence \
     FROM disaster_incidents.incidents";

const UPSERT_INCIDENT: &str = r#"
    INSERT INTO disaster_incidents.incidents
    (id, incident_type, title, description, location, lat, lng, severity, member_report_ids,
     created_at, status, casualties_mentioned, damage_mentioned, needs_help, resolved_source,
     resolved_confidence)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT (id) DO UPDATE
    SET incident_type = EXCLUDED.incident_type,
        title = EXCLUDED.title,
        description = EXCLUDED.description,
        location = EXCLUDED.location,
        lat = EXCLUDED.lat,
        lng = EXCLUDED.lng,
        severity = EXCLUDED.severity,
        member_report_ids = EXCLUDED.member_report_ids,
        created_at = EXCLUDED.created_at,
        status = EXCLUDED.status,
        casualties_mentioned = EXCLUDED.casualties_mentioned,
        damage_mentioned = EXCLUDED.damage_mentioned,
        needs_help = EXCLUDED.needs_help,
        resolved_source = EXCLUDED.resolved_source,
        resolved_confidence = EXCLUDED.resolved_confidence,
        updated_at = NOW()
    "#;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgIncidentStore {
    pool: PgPool,
}

impl PgIncidentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_in(
        tx: &mut Transaction<'_, Postgres>,
        incident: &Incident,
    ) -> Result<(), StoreError> {
        bind_incident(sqlx::query(UPSERT_INCIDENT), incident)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn bind_incident<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    incident: &'q Incident,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&incident.id)
        .bind(&incident.incident_type)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(&incident.location)
        .bind(incident.centroid.lat)
        .bind(incident.centroid.lng)
        .bind(incident.severity.as_str())
        .bind(&incident.member_report_ids)
        .bind(incident.created_at)
        .bind(incident.status.as_str())
        .bind(incident.casualties_mentioned)
        .bind(incident.damage_mentioned)
        .bind(incident.needs_help)
        .bind(incident.resolved_source.as_str())
        .bind(incident.resolved_confidence)
}

fn incident_from_row(row: &PgRow) -> Result<Incident, StoreError> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("resolved_source")?;

    Ok(Incident {
        id: row.try_get("id")?,
        incident_type: row.try_get("incident_type")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        centroid: Coordinates::new(row.try_get("lat")?, row.try_get("lng")?),
        severity: severity.parse::<Severity>().map_err(StoreError::Rejected)?,
        member_report_ids: row.try_get("member_report_ids")?,
        created_at: row.try_get("created_at")?,
        status: status.parse::<IncidentStatus>().map_err(StoreError::Rejected)?,
        casualties_mentioned: row.try_get("casualties_mentioned")?,
        damage_mentioned: row.try_get("damage_mentioned")?,
        needs_help: row.try_get("needs_help")?,
        resolved_source: source.parse::<ResolutionSource>().map_err(StoreError::Rejected)?,
        resolved_confidence: row.try_get("resolved_confidence")?,
    })
}

#[async_trait]
impl IncidentStore for PgIncidentStore {
    async fn upsert(&self, incident: &Incident) -> Result<(), StoreError> {
        bind_incident(sqlx::query(UPSERT_INCIDENT), incident)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM disaster_incidents.incidents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        let query = format!("{SELECT_INCIDENTS} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn query_near(&self, lat: f64, lng: f64, radius_km: f64) -> Result<Vec<Incident>, StoreError> {
        let band = radius_km / KM_PER_DEGREE_LAT;
        let query = format!("{SELECT_INCIDENTS} WHERE lat BETWEEN $1 AND $2");
        let rows = sqlx::query(&query)
            .bind(lat - band)
            .bind(lat + band)
            .fetch_all(&self.pool)
            .await?;

        let candidates = rows
            .iter()
            .map(incident_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(store::within_radius(
            candidates,
            Coordinates::new(lat, lng),
            radius_km,
        ))
    }

    async fn query_by_type(&self, incident_type: &str) -> Result<Vec<Incident>, StoreError> {
        let query = format!(
            "{SELECT_INCIDENTS} WHERE LOWER(incident_type) = LOWER($1) ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(incident_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
        let query = format!("{SELECT_INCIDENTS} ORDER BY id");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn replace_all(&self, incidents: &[Incident]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM disaster_incidents.incidents")
            .execute(&mut *tx)
            .await?;
        for incident in incidents {
            Self::upsert_in(&mut tx, incident).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
