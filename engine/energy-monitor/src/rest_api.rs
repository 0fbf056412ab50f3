//! REST API endpoints for the monitoring replica
//!
//! Daily consumption reports, replicated device lookup, the device-owner link
//! replication endpoint, and a health check.

use crate::aggregator::HourlyAggregator;
use chrono::NaiveDate;
use fact_replication::{AssignOutcome, DeviceRecord, OwnershipLinks, ReplicaStore, UserDeviceLink};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

/// Rejection carrying a structured error body
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl warp::reject::Reject for ApiError {}

/// Error response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub timestamp: String,
}

/// Error detail
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    fn new(code: &str, message: String, details: Option<serde_json::Value>) -> Self {
        Self {
            error: ErrorDetail { code: code.to_string(), message, details },
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn reject(status: StatusCode, body: ErrorResponse) -> warp::Rejection {
    warp::reject::custom(ApiError { status, body })
}

/// Daily consumption query parameters
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyParams {
    pub device_id: Uuid,
    pub date: NaiveDate,
}

/// Get one device's hourly consumption for a day
pub async fn get_daily_consumption(
    params: DailyParams,
    aggregator: Arc<HourlyAggregator>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match aggregator.daily_consumption(params.device_id, params.date).await {
        Ok(daily) => Ok(warp::reply::json(&daily)),
        Err(e) => {
            tracing::error!("Daily consumption query for device {} failed: {}", params.device_id, e);
            Err(reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("INTERNAL_ERROR", "Failed to load consumption".to_string(), None),
            ))
        }
    }
}

/// Get a replicated device by id
pub async fn get_device(
    device_id: Uuid,
    devices: Arc<dyn ReplicaStore<DeviceRecord>>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match devices.get(device_id).await {
        Ok(Some(device)) => Ok(warp::reply::json(&device)),
        Ok(None) => Err(reject(
            StatusCode::NOT_FOUND,
            ErrorResponse::new(
                "DEVICE_NOT_FOUND",
                format!("Device with ID '{}' not found", device_id),
                Some(serde_json::json!({ "device_id": device_id })),
            ),
        )),
        Err(e) => {
            tracing::error!("Device lookup for {} failed: {}", device_id, e);
            Err(reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("INTERNAL_ERROR", "Failed to load device".to_string(), None),
            ))
        }
    }
}

/// Record a device-owner link pushed by a peer service
pub async fn post_device_owner_link(
    link: UserDeviceLink,
    ownership: Arc<OwnershipLinks>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let details = Some(serde_json::json!({ "user_id": link.user_id, "device_id": link.device_id }));
    match ownership.assign(link).await {
        Ok(AssignOutcome::Linked) => Ok(warp::reply::with_status(warp::reply::json(&link), StatusCode::CREATED)),
        Ok(AssignOutcome::AlreadyLinked) => Ok(warp::reply::with_status(warp::reply::json(&link), StatusCode::OK)),
        Ok(AssignOutcome::UnknownUser) => Err(reject(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("USER_NOT_FOUND", format!("User with ID '{}' not found", link.user_id), details),
        )),
        Ok(AssignOutcome::UnknownDevice) => Err(reject(
            StatusCode::NOT_FOUND,
            ErrorResponse::new(
                "DEVICE_NOT_FOUND",
                format!("Device with ID '{}' not found", link.device_id),
                details,
            ),
        )),
        Err(e) => {
            tracing::error!("Linking device {} to user {} failed: {}", link.device_id, link.user_id, e);
            Err(reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("INTERNAL_ERROR", "Failed to store link".to_string(), None),
            ))
        }
    }
}

/// Turn rejections into the JSON error envelope
pub async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let (status, body) = if let Some(api) = err.find::<ApiError>() {
        (api.status, api.body.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", "Resource not found".to_string(), None))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, ErrorResponse::new("INVALID_QUERY", e.to_string(), None))
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, ErrorResponse::new("INVALID_BODY", e.to_string(), None))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorResponse::new("METHOD_NOT_ALLOWED", "Method not allowed".to_string(), None),
        )
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new("INTERNAL_ERROR", "Internal server error".to_string(), None),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Create all REST API routes
pub fn create_routes(
    aggregator: Arc<HourlyAggregator>,
    devices: Arc<dyn ReplicaStore<DeviceRecord>>,
    ownership: Arc<OwnershipLinks>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    let aggregator_filter = warp::any().map(move || aggregator.clone());
    let devices_filter = warp::any().map(move || devices.clone());
    let ownership_filter = warp::any().map(move || ownership.clone());

    // Daily consumption endpoint
    let daily = warp::path("energy-consumption")
        .and(warp::path("daily"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<DailyParams>())
        .and(aggregator_filter)
        .and_then(get_daily_consumption);

    // Device lookup endpoint
    let device = warp::path("devices")
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::get())
        .and(devices_filter)
        .and_then(get_device);

    // Replication endpoint for device ownership
    let owner_link = warp::path("device-owner-link")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(4 * 1024))
        .and(warp::body::json::<UserDeviceLink>())
        .and(ownership_filter)
        .and_then(post_device_owner_link);

    // Health check endpoint
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    });

    daily
        .or(device)
        .or(owner_link)
        .or(health)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_headers(vec!["content-type", "authorization"])
                .allow_methods(vec!["GET", "POST", "OPTIONS"]),
        )
        .recover(handle_rejection)
}
