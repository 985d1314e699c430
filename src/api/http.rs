//! HTTP API
//!
//! Thin JSON adapter over [`DispatchCoordinator`]. Errors render as
//! `{"message": ...}` with the status from [`Error::to_http_status`].

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::dispatch::{DispatchCoordinator, IndexUpdate, ReconcileReport};
use crate::model::{DriverId, DriverState, PassengerId};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::{middleware, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: DispatchCoordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
pub struct NameBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LocationBody {
    pub location: Location,
}

#[derive(Debug, Deserialize)]
pub struct StateBody {
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct RideRequestBody {
    pub passenger_id: PassengerId,
    pub location: Location,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LocationReply {
    pub id: DriverId,
    pub location: Location,
    pub index: IndexUpdate,
}

#[derive(Debug, Serialize)]
pub struct StateReply {
    pub id: DriverId,
    pub previous: Option<DriverState>,
    pub state: DriverState,
    pub index: IndexUpdate,
}

#[derive(Debug, Serialize)]
pub struct SampleReply {
    pub lat: f64,
    pub lng: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CandidateReply {
    pub id: DriverId,
    pub location: Location,
    pub distance_km: f64,
}

pub fn create_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/passengers", axum::routing::post(create_passenger))
        .route("/drivers", axum::routing::post(create_driver))
        .route("/drivers/:id", axum::routing::patch(update_state))
        .route("/drivers/:id/locations", axum::routing::put(update_location))
        .route("/drivers/:id/history", axum::routing::get(driver_history))
        .route("/requests", axum::routing::post(request_ride))
        .route("/admin/reconcile", axum::routing::post(admin_reconcile))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

/// Path ids that are not integers address nothing.
fn parse_id(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| Error::NotFound(format!("no resource with id {:?}", raw)))
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::validation(rejection.body_text()))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_passenger(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NameBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let NameBody { name } = body(payload)?;
    let passenger = state.coordinator.create_passenger(&name).await?;
    Ok(Json(json!({ "id": passenger.id })))
}

async fn create_driver(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NameBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let NameBody { name } = body(payload)?;
    let driver = state.coordinator.create_driver(&name).await?;
    Ok(Json(json!({ "id": driver.id })))
}

async fn update_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<LocationBody>, JsonRejection>,
) -> Result<Json<LocationReply>> {
    let id = parse_id(&id)?;
    let LocationBody { location } = body(payload)?;
    let update = state
        .coordinator
        .update_location(id, location.lat, location.lng)
        .await?;
    Ok(Json(LocationReply {
        id,
        location,
        index: update.index,
    }))
}

async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<StateBody>, JsonRejection>,
) -> Result<Json<StateReply>> {
    let id = parse_id(&id)?;
    let StateBody { state: requested } = body(payload)?;
    let requested: DriverState = requested.parse()?;
    let change = state.coordinator.set_state(id, requested).await?;
    Ok(Json(StateReply {
        id,
        previous: change.previous,
        state: change.current,
        index: change.index,
    }))
}

async fn driver_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<SampleReply>>> {
    let id = parse_id(&id)?;
    let since = params
        .since
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::validation(format!("Invalid since {:?}: {}", raw, e)))
        })
        .transpose()?;

    let samples = state.coordinator.driver_history(id, since).await?;
    Ok(Json(
        samples
            .into_iter()
            .map(|s| SampleReply {
                lat: s.lat,
                lng: s.lng,
                observed_at: s.observed_at,
            })
            .collect(),
    ))
}

async fn request_ride(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RideRequestBody>, JsonRejection>,
) -> Result<Json<Vec<CandidateReply>>> {
    let request = body(payload)?;
    let candidates = state
        .coordinator
        .request_ride(request.passenger_id, request.location.lat, request.location.lng)
        .await?;
    Ok(Json(
        candidates
            .into_iter()
            .map(|c| CandidateReply {
                id: c.driver_id,
                location: Location {
                    lat: c.lat,
                    lng: c.lng,
                },
                distance_km: c.distance_km,
            })
            .collect(),
    ))
}

async fn admin_reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>> {
    Ok(Json(state.coordinator.reconcile().await?))
}
