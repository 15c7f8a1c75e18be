//! Postgres repository for durable vehicle records.
//!
//! The observation upsert is a single `INSERT ... ON CONFLICT DO UPDATE`
//! statement so the running aggregates stay correct under concurrent
//! writers without explicit row locks; `xmax = 0` on the returned row
//! distinguishes a fresh insert from a merge.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Bool, Float8, Int4, Jsonb, Nullable, Varchar};
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::PgPool;
use crate::schema::abandoned_vehicles;
use crate::vehicles::{
    AbandonedVehicle, RiskLevel, StatusUpdate, UpsertOutcome, VehicleObservation, VehicleStatus,
    VehicleStore,
};

const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_RETRY_BASE: Duration = Duration::from_millis(100);

const UPSERT_SQL: &str = r#"
INSERT INTO abandoned_vehicles (
    vehicle_id, latitude, longitude, city, district, address, vehicle_type,
    similarity_score, similarity_percentage, risk_level, years_difference,
    first_detected, last_detected, detection_count, avg_similarity,
    max_similarity, bbox_data, extra_metadata
) VALUES (
    $1, $2, $3, $4, $5, $6, $7,
    $8, $9, $10, $11,
    NOW(), NOW(), 1, $8,
    $8, $12, $13
)
ON CONFLICT (vehicle_id) DO UPDATE SET
    last_detected = NOW(),
    detection_count = abandoned_vehicles.detection_count + 1,
    avg_similarity = (abandoned_vehicles.avg_similarity * abandoned_vehicles.detection_count
        + EXCLUDED.similarity_score) / (abandoned_vehicles.detection_count + 1),
    max_similarity = GREATEST(abandoned_vehicles.max_similarity, EXCLUDED.similarity_score),
    similarity_score = EXCLUDED.similarity_score,
    similarity_percentage = EXCLUDED.similarity_percentage,
    risk_level = EXCLUDED.risk_level,
    years_difference = EXCLUDED.years_difference,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    bbox_data = EXCLUDED.bbox_data,
    extra_metadata = EXCLUDED.extra_metadata,
    updated_at = NOW()
RETURNING (xmax = 0) AS created
"#;

#[derive(QueryableByName)]
struct UpsertRow {
    #[diesel(sql_type = Bool)]
    created: bool,
}

/// Filters accepted by `vehicles list`.
#[derive(Debug, Clone, Default)]
pub struct VehicleFilter {
    pub status: Option<VehicleStatus>,
    pub risk_level: Option<RiskLevel>,
    pub city: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct VehiclesRepository {
    pool: PgPool,
}

impl VehiclesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn upsert_once(pool: &PgPool, observation: &VehicleObservation) -> Result<UpsertOutcome> {
        let mut conn = pool
            .get()
            .map_err(|e| anyhow!("failed to get database connection: {e}"))?;

        let row: UpsertRow = diesel::sql_query(UPSERT_SQL)
            .bind::<Varchar, _>(&observation.vehicle_id)
            .bind::<Float8, _>(observation.latitude)
            .bind::<Float8, _>(observation.longitude)
            .bind::<Nullable<Varchar>, _>(&observation.city)
            .bind::<Nullable<Varchar>, _>(&observation.district)
            .bind::<Nullable<Varchar>, _>(&observation.address)
            .bind::<Varchar, _>(&observation.vehicle_type)
            .bind::<Float8, _>(observation.similarity_score)
            .bind::<Float8, _>(observation.similarity_percentage())
            .bind::<crate::schema::sql_types::RiskLevel, _>(observation.risk_level)
            .bind::<Int4, _>(observation.years_difference)
            .bind::<Nullable<Jsonb>, _>(serde_json::to_value(observation.bbox).ok())
            .bind::<Nullable<Jsonb>, _>(Some(observation.extra_metadata.clone()))
            .get_result(&mut conn)
            .context("observation upsert failed")?;

        Ok(UpsertOutcome { created: row.created })
    }

    pub async fn get(&self, vehicle_id: &str) -> Result<Option<AbandonedVehicle>> {
        let pool = self.pool.clone();
        let vehicle_id = vehicle_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;
            let vehicle = abandoned_vehicles::table
                .filter(abandoned_vehicles::vehicle_id.eq(&vehicle_id))
                .first::<AbandonedVehicle>(&mut conn)
                .optional()?;
            Ok(vehicle)
        })
        .await?
    }

    pub async fn list(&self, filter: VehicleFilter) -> Result<Vec<AbandonedVehicle>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;

            let mut query = abandoned_vehicles::table.into_boxed();
            if let Some(status) = filter.status {
                query = query.filter(abandoned_vehicles::status.eq(status));
            }
            if let Some(risk) = filter.risk_level {
                query = query.filter(abandoned_vehicles::risk_level.eq(risk));
            }
            if let Some(city) = filter.city {
                query = query.filter(abandoned_vehicles::city.eq(city));
            }

            let vehicles = query
                .order(abandoned_vehicles::last_detected.desc())
                .limit(filter.limit.unwrap_or(100))
                .load::<AbandonedVehicle>(&mut conn)?;
            Ok(vehicles)
        })
        .await?
    }

    /// Administrative removal. The detection pipeline never calls this.
    pub async fn delete(&self, vehicle_id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let vehicle_id = vehicle_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;
            let removed = diesel::delete(
                abandoned_vehicles::table.filter(abandoned_vehicles::vehicle_id.eq(&vehicle_id)),
            )
            .execute(&mut conn)?;
            Ok(removed > 0)
        })
        .await?
    }
}

/// A store error worth retrying: the connection died or the transaction
/// lost a serialization race. Constraint violations are not retried; the
/// ON CONFLICT clause already absorbs insert races.
fn is_transient(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<DieselError>() {
        Some(DieselError::DatabaseError(kind, _)) => matches!(
            kind,
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::SerializationFailure
        ),
        Some(_) => false,
        // Pool exhaustion / connection acquisition failures.
        None => error.to_string().contains("database connection"),
    }
}

#[async_trait]
impl VehicleStore for VehiclesRepository {
    async fn upsert_observation(&self, observation: &VehicleObservation) -> Result<UpsertOutcome> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=UPSERT_ATTEMPTS {
            let pool = self.pool.clone();
            let to_write = observation.clone();
            let result =
                tokio::task::spawn_blocking(move || Self::upsert_once(&pool, &to_write)).await?;

            match result {
                Ok(outcome) => {
                    metrics::counter!("vehicles.upsert.ok").increment(1);
                    debug!(
                        vehicle_id = observation_id_suffix(&observation.vehicle_id),
                        created = outcome.created,
                        "observation upserted"
                    );
                    return Ok(outcome);
                }
                Err(e) if is_transient(&e) && attempt < UPSERT_ATTEMPTS => {
                    warn!(attempt, "transient store error, retrying upsert: {e}");
                    metrics::counter!("vehicles.upsert.retry").increment(1);
                    tokio::time::sleep(UPSERT_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    metrics::counter!("vehicles.upsert.error").increment(1);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("upsert retries exhausted")))
    }

    async fn update_status(
        &self,
        vehicle_id: &str,
        new_status: VehicleStatus,
        note: Option<&str>,
    ) -> Result<StatusUpdate> {
        let pool = self.pool.clone();
        let vehicle_id = vehicle_id.to_string();
        let note = note.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;

            let outcome = conn.transaction::<StatusUpdate, DieselError, _>(|conn| {
                let current: Option<VehicleStatus> = abandoned_vehicles::table
                    .filter(abandoned_vehicles::vehicle_id.eq(&vehicle_id))
                    .select(abandoned_vehicles::status)
                    .for_update()
                    .first(conn)
                    .optional()?;

                let Some(current) = current else {
                    return Ok(StatusUpdate::NotFound);
                };
                if current != new_status && !current.can_transition_to(new_status) {
                    return Ok(StatusUpdate::InvalidTransition);
                }

                match &note {
                    Some(note) => {
                        diesel::update(
                            abandoned_vehicles::table
                                .filter(abandoned_vehicles::vehicle_id.eq(&vehicle_id)),
                        )
                        .set((
                            abandoned_vehicles::status.eq(new_status),
                            abandoned_vehicles::verification_notes.eq(note),
                            abandoned_vehicles::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn)?;
                    }
                    None => {
                        diesel::update(
                            abandoned_vehicles::table
                                .filter(abandoned_vehicles::vehicle_id.eq(&vehicle_id)),
                        )
                        .set((
                            abandoned_vehicles::status.eq(new_status),
                            abandoned_vehicles::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn)?;
                    }
                }
                Ok(StatusUpdate::Updated)
            })?;

            Ok(outcome)
        })
        .await?
    }
}

/// Last characters of the id for log lines; the full hash is noisy.
fn observation_id_suffix(vehicle_id: &str) -> &str {
    let len = vehicle_id.len();
    &vehicle_id[len.saturating_sub(8)..]
}
