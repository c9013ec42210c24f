//! The `/manage` REST surface.
//!
//! Thin handlers over the registry, automation engine and scene engine; all
//! validation and mutation lives in those layers, and every failure maps to
//! the JSON error envelope in `error.rs`. A request id is attached to each
//! response and to the request's trace span.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::automation::{Automation, AutomationEngine, AutomationInput, AutomationPatch};
use crate::config::Config;
use crate::error::Error;
use crate::mqtt::Commander;
use crate::registry::{DeviceView, Registry};
use crate::scene::{Scene, SceneEngine, SceneInput, SceneLight, SceneOrder};
use crate::store::Store;
use crate::websocket::WsHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub engine: Arc<AutomationEngine>,
    pub scenes: Arc<SceneEngine>,
    pub hub: Arc<WsHub>,
    pub commander: Commander,
    pub started_at: std::time::Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Zones
        .route("/manage/zones", get(list_zones).post(create_zone))
        .route("/manage/zones/:zone", put(rename_zone).delete(delete_zone))
        .route(
            "/manage/zones/:zone/devices",
            get(zone_devices).put(assign_device).delete(unassign_device),
        )
        // Devices
        .route("/manage/devices", get(list_devices))
        .route("/manage/devices/permit_join", post(permit_join))
        .route("/manage/device/:device", delete(delete_device))
        .route("/manage/device/:device/custom_name", put(set_custom_name))
        .route(
            "/manage/device/:device/custom_category",
            put(set_custom_category),
        )
        .route("/manage/device/:device/metadata", get(device_metadata))
        // Automations
        .route(
            "/manage/automations",
            get(list_automations).post(create_automation),
        )
        .route(
            "/manage/automations/:id",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
        .route("/manage/automations/:id/run", post(run_automation))
        // Scenes
        .route(
            "/manage/scene-management",
            get(list_scenes).post(create_scene),
        )
        .route("/manage/scene-management/reorder", put(reorder_scenes))
        .route("/manage/scene-management/test", post(test_scene))
        .route(
            "/manage/scene-management/:id",
            get(get_scene).put(update_scene).delete(delete_scene),
        )
        .route("/manage/scene-management/:id/duplicate", post(duplicate_scene))
        // Health
        .route("/health", get(health))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Assign a request id, carry it through the trace span and the task-local
/// the error envelope reads, and echo it back in the `x-request-id` header.
async fn request_id(request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = crate::error::REQUEST_ID
        .scope(id.clone(), next.run(request).instrument(span))
        .await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ── Zones ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ZoneBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RenameQuery {
    new_name: String,
}

#[derive(Debug, Deserialize)]
struct DeviceBody {
    device: String,
}

async fn list_zones(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.zones())
}

async fn create_zone(
    State(state): State<AppState>,
    Json(body): Json<ZoneBody>,
) -> Result<impl IntoResponse, Error> {
    state.registry.create_zone(&body.name)?;
    Ok((StatusCode::CREATED, Json(json!({ "name": body.name }))))
}

async fn rename_zone(
    State(state): State<AppState>,
    Path(zone): Path<String>,
    Query(query): Query<RenameQuery>,
) -> Result<Json<Value>, Error> {
    state.registry.rename_zone(&zone, &query.new_name)?;
    Ok(Json(json!({ "name": query.new_name })))
}

async fn delete_zone(
    State(state): State<AppState>,
    Path(zone): Path<String>,
) -> Result<StatusCode, Error> {
    state.registry.delete_zone(&zone)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn zone_devices(
    State(state): State<AppState>,
    Path(zone): Path<String>,
) -> Result<Json<Vec<String>>, Error> {
    Ok(Json(state.registry.zone_devices(&zone)?))
}

async fn assign_device(
    State(state): State<AppState>,
    Path(zone): Path<String>,
    Json(body): Json<DeviceBody>,
) -> Result<StatusCode, Error> {
    state.registry.assign_zone(&body.device, &zone)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unassign_device(
    State(state): State<AppState>,
    Path(zone): Path<String>,
    Json(body): Json<DeviceBody>,
) -> Result<StatusCode, Error> {
    state.registry.unassign_zone(&body.device, &zone)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Devices ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CustomNameQuery {
    custom_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryQuery {
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermitJoinBody {
    value: bool,
    #[serde(default)]
    time: Option<u32>,
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(state.registry.devices())
}

async fn delete_device(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<StatusCode, Error> {
    state.registry.delete_device(&device)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_custom_name(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(query): Query<CustomNameQuery>,
) -> Result<StatusCode, Error> {
    state.registry.set_custom_name(&device, query.custom_name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_custom_category(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(query): Query<CategoryQuery>,
) -> Result<StatusCode, Error> {
    state.registry.set_custom_category(&device, query.category)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn device_metadata(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<Value>, Error> {
    let metadata = state.registry.metadata(&device)?;
    Ok(Json(serde_json::to_value(metadata)?))
}

async fn permit_join(
    State(state): State<AppState>,
    Json(body): Json<PermitJoinBody>,
) -> StatusCode {
    let time = body.time.unwrap_or(if body.value { 120 } else { 0 });
    state.commander.permit_join(body.value, time);
    StatusCode::ACCEPTED
}

// ── Automations ──────────────────────────────────────────

async fn list_automations(State(state): State<AppState>) -> Json<Vec<Automation>> {
    Json(state.engine.list())
}

async fn create_automation(
    State(state): State<AppState>,
    Json(input): Json<AutomationInput>,
) -> Result<impl IntoResponse, Error> {
    let automation = state.engine.create(input)?;
    Ok((StatusCode::CREATED, Json(automation)))
}

async fn get_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Automation>, Error> {
    Ok(Json(state.engine.get(&id)?))
}

async fn update_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<AutomationPatch>,
) -> Result<Json<Automation>, Error> {
    Ok(Json(state.engine.update(&id, patch)?))
}

async fn delete_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.engine.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let fired = state.engine.run(&id).await?;
    Ok(Json(json!({ "fired": fired })))
}

// ── Scenes ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ZoneQuery {
    zone: String,
}

#[derive(Debug, Deserialize)]
struct TestSceneBody {
    lights: Vec<SceneLight>,
}

async fn list_scenes(State(state): State<AppState>) -> Json<Vec<Scene>> {
    Json(state.scenes.list())
}

async fn create_scene(
    State(state): State<AppState>,
    Json(input): Json<SceneInput>,
) -> Result<impl IntoResponse, Error> {
    let scene = state.scenes.create(input)?;
    Ok((StatusCode::CREATED, Json(scene)))
}

async fn get_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scene>, Error> {
    Ok(Json(state.scenes.get(&id)?))
}

async fn update_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SceneInput>,
) -> Result<Json<Scene>, Error> {
    Ok(Json(state.scenes.update(&id, input)?))
}

async fn delete_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.scenes.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn duplicate_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let scene = state.scenes.duplicate(&id)?;
    Ok((StatusCode::CREATED, Json(scene)))
}

async fn reorder_scenes(
    State(state): State<AppState>,
    Json(orders): Json<Vec<SceneOrder>>,
) -> Result<Json<Vec<Scene>>, Error> {
    state.scenes.reorder(orders)?;
    Ok(Json(state.scenes.list()))
}

async fn test_scene(
    State(state): State<AppState>,
    Query(query): Query<ZoneQuery>,
    Json(body): Json<TestSceneBody>,
) -> Result<Json<Value>, Error> {
    let driven = state.scenes.test_in_zone(&body.lights, &query.zone)?;
    Ok(Json(json!({ "devices_driven": driven })))
}

// ── Health ───────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    let (device_count, zone_count, automation_count) = state
        .store
        .with_home(|doc| (doc.device_cache.len(), doc.zones.len(), doc.automations.len()));
    let scene_count = state.store.with_scenes(|doc| doc.scenes.len());

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "bridge_state": state.registry.bridge_state(),
        "devices": device_count,
        "zones": zone_count,
        "automations": automation_count,
        "scenes": scene_count,
        "ws_clients": state.hub.client_count(),
    }))
}
