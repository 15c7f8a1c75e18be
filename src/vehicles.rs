//! Durable vehicle records and the store contract the pipeline writes to.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RiskThresholds;
use crate::regions::BBox;

/// Risk classification of a confirmed pair, derived purely from the
/// similarity percentage and the year gap at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::RiskLevel")]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl RiskLevel {
    /// Pure classification function. Thresholds are inclusive: a pair at
    /// exactly 95% similarity with a 3-year gap is CRITICAL.
    pub fn classify(
        similarity_percentage: f64,
        years_difference: i32,
        thresholds: &RiskThresholds,
    ) -> Self {
        let s = similarity_percentage / 100.0;
        if s >= thresholds.critical_similarity && years_difference >= thresholds.critical_min_years
        {
            RiskLevel::Critical
        } else if s >= thresholds.high_similarity && years_difference >= thresholds.high_min_years {
            RiskLevel::High
        } else if s >= thresholds.medium_similarity {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Critical => write!(f, "CRITICAL"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::Low => write!(f, "LOW"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(RiskLevel::Critical),
            "HIGH" => Ok(RiskLevel::High),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "LOW" => Ok(RiskLevel::Low),
            other => anyhow::bail!("unknown risk level: {other}"),
        }
    }
}

/// Review lifecycle of a vehicle record. Only `update_status` moves a record
/// between states; the detection pipeline never touches status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::VehicleStatus")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    Detected,
    Investigating,
    Verified,
    Resolved,
    FalsePositive,
}

impl VehicleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VehicleStatus::Resolved | VehicleStatus::FalsePositive)
    }

    /// DETECTED -> (INVESTIGATING <-> VERIFIED) -> RESOLVED, with
    /// FALSE_POSITIVE reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: VehicleStatus) -> bool {
        use VehicleStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, FalsePositive) => true,
            (Detected, Investigating) | (Detected, Verified) => true,
            (Investigating, Verified) | (Verified, Investigating) => true,
            (Investigating, Resolved) | (Verified, Resolved) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleStatus::Detected => write!(f, "DETECTED"),
            VehicleStatus::Investigating => write!(f, "INVESTIGATING"),
            VehicleStatus::Verified => write!(f, "VERIFIED"),
            VehicleStatus::Resolved => write!(f, "RESOLVED"),
            VehicleStatus::FalsePositive => write!(f, "FALSE_POSITIVE"),
        }
    }
}

impl std::str::FromStr for VehicleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DETECTED" => Ok(VehicleStatus::Detected),
            "INVESTIGATING" => Ok(VehicleStatus::Investigating),
            "VERIFIED" => Ok(VehicleStatus::Verified),
            "RESOLVED" => Ok(VehicleStatus::Resolved),
            "FALSE_POSITIVE" => Ok(VehicleStatus::FalsePositive),
            other => anyhow::bail!("unknown vehicle status: {other}"),
        }
    }
}

/// One persisted vehicle record; mirrors the `abandoned_vehicles` table.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct AbandonedVehicle {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub district: Option<String>,
    pub address: Option<String>,
    pub vehicle_type: String,
    pub similarity_score: f64,
    pub similarity_percentage: f64,
    pub risk_level: RiskLevel,
    pub years_difference: i32,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub detection_count: i32,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    pub status: VehicleStatus,
    pub verification_notes: Option<String>,
    pub bbox_data: Option<serde_json::Value>,
    pub extra_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One confirmed abandoned observation, ready for the store.
#[derive(Debug, Clone)]
pub struct VehicleObservation {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub district: Option<String>,
    pub address: Option<String>,
    pub vehicle_type: String,
    /// Clamped cosine similarity in [0, 1].
    pub similarity_score: f64,
    pub risk_level: RiskLevel,
    pub years_difference: i32,
    pub bbox: BBox,
    pub extra_metadata: serde_json::Value,
}

impl VehicleObservation {
    pub fn similarity_percentage(&self) -> f64 {
        self.similarity_score * 100.0
    }
}

/// Location-based durable identity: centroid snapped to the spatial bin
/// grid, combined with the year bucket of the earlier capture. Repeated
/// runs over the same scene always derive the same id.
pub fn derive_vehicle_id(
    latitude: f64,
    longitude: f64,
    earlier_year: i32,
    spatial_bin_degrees: f64,
    year_bucket_years: i32,
) -> String {
    let lat_bin = (latitude / spatial_bin_degrees).round() as i64;
    let lon_bin = (longitude / spatial_bin_degrees).round() as i64;
    let year_bucket = earlier_year.div_euclid(year_bucket_years.max(1));

    let mut hasher = Sha256::new();
    hasher.update(lat_bin.to_le_bytes());
    hasher.update(lon_bin.to_le_bytes());
    hasher.update(year_bucket.to_le_bytes());
    let digest = hasher.finalize();
    format!("veh_{}", hex::encode(&digest[..16]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
}

/// Result of an explicit status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Updated,
    NotFound,
    /// The requested transition is not legal from the current state.
    InvalidTransition,
}

/// Store contract used by the abandonment engine and the operator CLI.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// Insert a fresh record or fold the observation into the existing one.
    /// Atomic per `vehicle_id`: concurrent writers never create duplicates,
    /// and the running aggregates reflect every observation exactly once.
    async fn upsert_observation(&self, observation: &VehicleObservation) -> Result<UpsertOutcome>;

    async fn update_status(
        &self,
        vehicle_id: &str,
        new_status: VehicleStatus,
        note: Option<&str>,
    ) -> Result<StatusUpdate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> RiskThresholds {
        RiskThresholds::default()
    }

    #[test]
    fn risk_classification_boundaries_are_inclusive() {
        let t = thresholds();
        assert_eq!(RiskLevel::classify(95.0, 3, &t), RiskLevel::Critical);
        assert_eq!(RiskLevel::classify(95.0, 2, &t), RiskLevel::High);
        assert_eq!(RiskLevel::classify(90.0, 2, &t), RiskLevel::High);
        assert_eq!(RiskLevel::classify(90.0, 1, &t), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(85.0, 0, &t), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(84.999, 10, &t), RiskLevel::Low);
    }

    #[test]
    fn risk_is_a_pure_function() {
        let t = thresholds();
        for _ in 0..3 {
            assert_eq!(RiskLevel::classify(97.5, 4, &t), RiskLevel::Critical);
        }
    }

    #[test]
    fn identity_is_stable_within_a_bin() {
        let id_a = derive_vehicle_id(37.123456, 127.654321, 2020, 1e-5, 1);
        let id_b = derive_vehicle_id(37.1234562, 127.6543208, 2020, 1e-5, 1);
        assert_eq!(id_a, id_b, "sub-bin jitter must not change identity");
    }

    #[test]
    fn identity_changes_across_bins_and_years() {
        let base = derive_vehicle_id(37.123456, 127.654321, 2020, 1e-5, 1);
        let moved = derive_vehicle_id(37.123556, 127.654321, 2020, 1e-5, 1);
        let later = derive_vehicle_id(37.123456, 127.654321, 2021, 1e-5, 1);
        assert_ne!(base, moved);
        assert_ne!(base, later);
    }

    #[test]
    fn wider_year_bucket_merges_adjacent_years() {
        let a = derive_vehicle_id(37.0, 127.0, 2020, 1e-5, 2);
        let b = derive_vehicle_id(37.0, 127.0, 2021, 1e-5, 2);
        assert_eq!(a, b, "2020 and 2021 share a 2-year bucket");
    }

    #[test]
    fn status_machine_accepts_documented_paths() {
        use VehicleStatus::*;
        assert!(Detected.can_transition_to(Investigating));
        assert!(Investigating.can_transition_to(Verified));
        assert!(Verified.can_transition_to(Investigating));
        assert!(Verified.can_transition_to(Resolved));
        assert!(Detected.can_transition_to(FalsePositive));
        assert!(Investigating.can_transition_to(FalsePositive));
    }

    #[test]
    fn status_machine_rejects_terminal_exits_and_skips() {
        use VehicleStatus::*;
        assert!(!Resolved.can_transition_to(Investigating));
        assert!(!FalsePositive.can_transition_to(Detected));
        assert!(!Detected.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(FalsePositive));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            VehicleStatus::Detected,
            VehicleStatus::Investigating,
            VehicleStatus::Verified,
            VehicleStatus::Resolved,
            VehicleStatus::FalsePositive,
        ] {
            let parsed: VehicleStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
