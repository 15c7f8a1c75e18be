//! `derelict vehicles` - list records and drive the review state machine.

use anyhow::{Context, Result};
use std::env;

use crate::db;
use crate::vehicles::{StatusUpdate, VehicleStatus, VehicleStore};
use crate::vehicles_repo::{VehicleFilter, VehiclesRepository};

fn repository() -> Result<VehiclesRepository> {
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = db::build_pool(&database_url)?;
    Ok(VehiclesRepository::new(pool))
}

pub async fn handle_vehicles_list(
    status: Option<String>,
    risk: Option<String>,
    city: Option<String>,
    limit: i64,
    json: bool,
) -> Result<()> {
    let filter = VehicleFilter {
        status: status.as_deref().map(str::parse).transpose()?,
        risk_level: risk.as_deref().map(str::parse).transpose()?,
        city,
        limit: Some(limit),
    };

    let vehicles = repository()?.list(filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&vehicles)?);
        return Ok(());
    }

    for vehicle in &vehicles {
        println!(
            "{}  {:9}  {:14}  {:6.1}%  x{:<3}  ({:.5}, {:.5})  {}",
            vehicle.vehicle_id,
            vehicle.risk_level.to_string(),
            vehicle.status.to_string(),
            vehicle.similarity_percentage,
            vehicle.detection_count,
            vehicle.latitude,
            vehicle.longitude,
            vehicle.city.as_deref().unwrap_or("-"),
        );
    }
    println!("{} vehicle(s)", vehicles.len());
    Ok(())
}

pub async fn handle_vehicles_update_status(
    vehicle_id: String,
    status: String,
    note: Option<String>,
) -> Result<()> {
    let new_status: VehicleStatus = status.parse()?;
    let repo = repository()?;

    match repo
        .update_status(&vehicle_id, new_status, note.as_deref())
        .await?
    {
        StatusUpdate::Updated => {
            println!("{vehicle_id} -> {new_status}");
            Ok(())
        }
        StatusUpdate::NotFound => anyhow::bail!("no vehicle with id {vehicle_id}"),
        StatusUpdate::InvalidTransition => {
            anyhow::bail!("transition to {new_status} is not allowed from the current status")
        }
    }
}
