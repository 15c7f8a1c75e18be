//! Per-run analysis log rows: one row per `analyze` call, including the
//! failed ones.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::db::PgPool;
use crate::schema::analysis_logs;

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = analysis_logs)]
pub struct AnalysisLog {
    pub run_id: Uuid,
    pub region_label: Option<String>,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub zoom: i32,
    pub tile_radius: i32,
    pub year1: i32,
    pub year2: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub candidates_considered: i32,
    pub comparisons_done: i32,
    pub new_vehicles: i32,
    pub updated_vehicles: i32,
    pub error: Option<String>,
}

/// Sink for run logs; the engine depends on this seam, not on Postgres.
#[async_trait]
pub trait AnalysisLogStore: Send + Sync {
    async fn record(&self, log: &AnalysisLog) -> Result<()>;
}

#[derive(Clone)]
pub struct AnalysisLogsRepository {
    pool: PgPool,
}

impl AnalysisLogsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AnalysisLog>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;
            let logs = analysis_logs::table
                .order(analysis_logs::started_at.desc())
                .limit(limit)
                .load::<AnalysisLog>(&mut conn)?;
            Ok(logs)
        })
        .await?
    }
}

#[async_trait]
impl AnalysisLogStore for AnalysisLogsRepository {
    async fn record(&self, log: &AnalysisLog) -> Result<()> {
        let pool = self.pool.clone();
        let log = log.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow!("failed to get database connection: {e}"))?;
            diesel::insert_into(analysis_logs::table)
                .values(&log)
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }
}
