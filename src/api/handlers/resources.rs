//! Versioned resource handlers.
//!
//! Every mutation goes through the compare-and-set contract in the store:
//! the version read is the version asserted, and a stale write comes back as
//! an edit conflict the caller must resolve by refetching. Clients may also
//! assert a version themselves with the `X-Expected-Version` header to fail
//! fast before the store round-trip.

use axum::{
    extract::{Path, State},
    http::{header::LOCATION, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::api::{
    auth::{require_permission, Principal},
    error::ApiError,
    store::ResourceStore,
    AppState,
};

pub const PERMISSION_READ: &str = "resources:read";
pub const PERMISSION_WRITE: &str = "resources:write";

/// Optional client-side version assertion, checked before the store write.
pub const EXPECTED_VERSION_HEADER: &str = "x-expected-version";

#[derive(Debug, Deserialize)]
pub struct ResourceInput {
    pub payload: serde_json::Value,
}

/// `POST /v1/resources`
///
/// # Errors
///
/// Authorization gate errors, plus anything the store reports
pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(input): Json<ResourceInput>,
) -> Result<Response, ApiError> {
    let user = require_permission(&principal, PERMISSION_WRITE, state.permissions.as_ref()).await?;

    let record = state.resources.create(input.payload).await?;

    let actor = user.id;
    let resource_id = record.id;
    state.tasks.spawn("audit.resource_created", async move {
        info!(%actor, %resource_id, "resource created");
    });

    let mut response = (
        StatusCode::CREATED,
        Json(json!({ "resource": record })),
    )
        .into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/v1/resources/{resource_id}")) {
        response.headers_mut().insert(LOCATION, location);
    }
    Ok(response)
}

/// `GET /v1/resources/{id}`
///
/// # Errors
///
/// Authorization gate errors, [`ApiError::NotFound`], store errors
pub async fn show(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_permission(&principal, PERMISSION_READ, state.permissions.as_ref()).await?;

    let record = state.resources.get(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "resource": record })).into_response())
}

/// `PATCH /v1/resources/{id}`
///
/// Reads the current record, then writes conditioned on the version it just
/// read. An `X-Expected-Version` header that disagrees with the current
/// version is rejected as a conflict without touching the store again.
///
/// # Errors
///
/// Authorization gate errors, [`ApiError::NotFound`],
/// [`ApiError::EditConflict`], store errors
pub async fn update(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<ResourceInput>,
) -> Result<Response, ApiError> {
    require_permission(&principal, PERMISSION_WRITE, state.permissions.as_ref()).await?;

    let current = state.resources.get(id).await?.ok_or(ApiError::NotFound)?;

    if let Some(expected) = headers.get(EXPECTED_VERSION_HEADER) {
        let matches_current = expected
            .to_str()
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            .is_some_and(|version| version == current.version);
        if !matches_current {
            return Err(ApiError::EditConflict);
        }
    }

    let version = state
        .resources
        .update(id, current.version, input.payload.clone())
        .await?;

    Ok(Json(json!({
        "resource": {
            "id": id,
            "payload": input.payload,
            "version": version,
        }
    }))
    .into_response())
}

/// `DELETE /v1/resources/{id}`
///
/// Unconditional; deletion does not participate in version checking.
///
/// # Errors
///
/// Authorization gate errors, [`ApiError::NotFound`], store errors
pub async fn remove(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_permission(&principal, PERMISSION_WRITE, state.permissions.as_ref()).await?;

    if !state.resources.delete(id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "message": "resource successfully deleted" })).into_response())
}
