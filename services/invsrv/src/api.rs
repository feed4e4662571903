//! Settings and status HTTP API

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use common::{AppError, ComponentHealth, HealthStatus, ServiceStatus, SuccessResponse};
use inverter_modbus::ClientError;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::cache::{Cache, CacheEntry};
use crate::gateway::{WriteError, WriteGateway};
use crate::metrics;
use crate::register_map::{Access, RegisterMap};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub gateway: WriteGateway,
    pub registers: Arc<RegisterMap>,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/registers", get(list_registers))
        .route("/api/faults", get(list_faults))
        .route(
            "/api/registers/{name}",
            get(get_register).post(write_register),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// One register or derived value with its cached state
#[derive(Debug, Clone, Serialize)]
pub struct RegisterView {
    pub name: String,
    /// `None` for derived values
    pub address: Option<u16>,
    pub unit: String,
    pub description: String,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// `null` until the device has confirmed a value
    pub value: Option<f64>,
    pub raw: Option<i64>,
    pub valid: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RegisterView {
    fn with_entry(mut self, entry: &CacheEntry) -> Self {
        if entry.valid {
            self.value = Some(entry.value);
            self.raw = Some(entry.raw);
        }
        self.valid = entry.valid;
        self.last_updated = entry.last_updated;
        self
    }
}

fn view(map: &RegisterMap, name: &str) -> Option<RegisterView> {
    let blank = |name: &str, unit: &str, description: &str| RegisterView {
        name: name.to_string(),
        address: None,
        unit: unit.to_string(),
        description: description.to_string(),
        writable: false,
        min: None,
        max: None,
        value: None,
        raw: None,
        valid: false,
        last_updated: None,
    };

    if let Some(reg) = map.get(name) {
        let mut v = blank(&reg.name, &reg.unit, &reg.description);
        v.address = Some(reg.address);
        if let Access::Writable { min, max } = reg.access {
            v.writable = true;
            v.min = Some(min);
            v.max = Some(max);
        }
        return Some(v);
    }
    map.find_derived(name)
        .map(|d| blank(&d.name, &d.unit, &d.description))
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub value: f64,
}

impl From<WriteError> for AppError {
    fn from(err: WriteError) -> Self {
        let message = err.to_string();
        match err {
            WriteError::UnknownRegister(_) => AppError::not_found(message),
            WriteError::NotWritable(_) => AppError::forbidden(message),
            WriteError::OutOfRange { name, .. } => AppError::unprocessable(name, message),
            WriteError::Client(ClientError::Rejected(code)) => {
                AppError::conflict(message).with_details(code.description())
            },
            WriteError::Client(e) => AppError::service_unavailable(e.to_string()),
        }
    }
}

/// Health check endpoint
///
/// @route GET /health
/// @output `Json<SuccessResponse<HealthStatus>>`
/// @status 200 - Healthy, or degraded while no values have been read yet
/// @status 503 - Bus worker has stopped
pub async fn health_check(State(state): State<AppState>) -> Response {
    let snapshot = state.cache.snapshot();
    let valid = snapshot.iter().filter(|(_, e)| e.valid).count();

    let mut checks = HashMap::new();
    let bus = if state.gateway.bus_closed() {
        ComponentHealth {
            status: ServiceStatus::Unhealthy,
            message: Some("modbus worker stopped".to_string()),
        }
    } else {
        ComponentHealth {
            status: ServiceStatus::Healthy,
            message: None,
        }
    };
    let poller = ComponentHealth {
        status: if valid > 0 {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Degraded
        },
        message: Some(format!(
            "{} poll cycles, {}/{} values valid",
            snapshot.cycle,
            valid,
            snapshot.len()
        )),
    };

    let status = match (&bus.status, &poller.status) {
        (ServiceStatus::Unhealthy, _) => ServiceStatus::Unhealthy,
        (_, ServiceStatus::Degraded) => ServiceStatus::Degraded,
        _ => ServiceStatus::Healthy,
    };
    checks.insert("modbus".to_string(), bus);
    checks.insert("poller".to_string(), poller);

    let now = Utc::now();
    let code = if matches!(status, ServiceStatus::Unhealthy) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let health = HealthStatus {
        status,
        service: "invsrv".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (now - state.started_at).num_seconds().max(0) as u64,
        timestamp: now,
        checks,
    };
    (code, Json(SuccessResponse::new(health))).into_response()
}

/// List every register and derived value
///
/// @route GET /api/registers
/// @output `Json<SuccessResponse<Vec<RegisterView>>>` - Address order, derived values last
/// @status 200 - Success
pub async fn list_registers(
    State(state): State<AppState>,
) -> Json<SuccessResponse<Vec<RegisterView>>> {
    let snapshot = state.cache.snapshot();
    let views = state
        .registers
        .value_names()
        .filter_map(|name| {
            let v = view(&state.registers, name)?;
            Some(match snapshot.get(name) {
                Some(entry) => v.with_entry(entry),
                None => v,
            })
        })
        .collect();
    Json(SuccessResponse::new(views))
}

/// Active codes of one fault bitset
#[derive(Debug, Clone, Serialize)]
pub struct FaultView {
    pub name: String,
    pub address: u16,
    pub words: u16,
    pub description: String,
    /// `F<code>` labels, lowest code first
    pub codes: Vec<String>,
    pub valid: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// List every fault bitset with its active codes
///
/// @route GET /api/faults
/// @output `Json<SuccessResponse<Vec<FaultView>>>`
/// @status 200 - Success; `codes` is empty while never polled
pub async fn list_faults(State(state): State<AppState>) -> Json<SuccessResponse<Vec<FaultView>>> {
    let snapshot = state.cache.snapshot();
    let views = state
        .registers
        .faults()
        .iter()
        .map(|block| {
            let entry = snapshot.fault(&block.name);
            FaultView {
                name: block.name.clone(),
                address: block.address,
                words: block.words,
                description: block.description.clone(),
                codes: entry
                    .map(|e| e.codes.iter().map(|c| format!("F{c}")).collect())
                    .unwrap_or_default(),
                valid: entry.is_some_and(|e| e.valid),
                last_updated: entry.and_then(|e| e.last_updated),
            }
        })
        .collect();
    Json(SuccessResponse::new(views))
}

/// Read one cached value
///
/// @route GET /api/registers/{name}
/// @output `Json<SuccessResponse<RegisterView>>`
/// @status 200 - Success; `value` is null while never polled
/// @status 404 - Unknown name
pub async fn get_register(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse<RegisterView>>, AppError> {
    let v = view(&state.registers, &name)
        .ok_or_else(|| AppError::not_found(format!("unknown register: {name}")))?;
    let entry = state
        .cache
        .get(&name)
        .map_err(|e| AppError::not_found(e.to_string()))?;
    Ok(Json(SuccessResponse::new(v.with_entry(&entry))))
}

/// Write a setting
///
/// @route POST /api/registers/{name}
/// @input Json(body): `{"value": <number>}`
/// @output `Json<SuccessResponse<RegisterView>>` - Confirmed value
/// @status 200 - Device confirmed the write
/// @status 403 - Register is read-only
/// @status 404 - Unknown register
/// @status 409 - Device rejected the write
/// @status 422 - Value outside range or resolution
/// @status 503 - Device unreachable
pub async fn write_register(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<Json<SuccessResponse<RegisterView>>, AppError> {
    let entry = state.gateway.write(&name, body.value).await?;
    let v = view(&state.registers, &name)
        .ok_or_else(|| AppError::not_found(format!("unknown register: {name}")))?;
    Ok(Json(SuccessResponse::new(v.with_entry(&entry))))
}

/// Prometheus exposition
///
/// @route GET /metrics
/// @output text/plain exposition format
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = metrics::render(&state.registers, &state.cache.snapshot(), Utc::now());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
