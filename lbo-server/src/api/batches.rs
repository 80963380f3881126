//! Batch API handlers
//!
//! POST /api/batches, POST /api/batches/{batch_id}/items, GET /api/batches/{batch_id}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lbo_common::BatchStatus;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    models::{BatchView, ItemSource},
    AppState,
};

/// POST /api/batches request
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub client_id: String,
    pub total: u64,
}

/// POST /api/batches response
#[derive(Debug, Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: String,
    pub status: BatchStatus,
}

/// One submitted item: an image URL or base64 upload
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ItemPayload {
    Url { url: String },
    Upload { filename: String, data_base64: String },
}

impl ItemPayload {
    fn into_source(self, index: usize) -> ApiResult<ItemSource> {
        match self {
            ItemPayload::Url { url } => {
                if url.trim().is_empty() {
                    return Err(ApiError::BadRequest(format!("item {}: empty url", index)));
                }
                Ok(ItemSource::Url(url))
            }
            ItemPayload::Upload {
                filename,
                data_base64,
            } => {
                let data = STANDARD.decode(data_base64.as_bytes()).map_err(|e| {
                    ApiError::BadRequest(format!("item {}: invalid base64 data: {}", index, e))
                })?;
                Ok(ItemSource::Upload { filename, data })
            }
        }
    }
}

/// POST /api/batches/{batch_id}/items request
#[derive(Debug, Deserialize)]
pub struct SubmitItemsRequest {
    pub items: Vec<ItemPayload>,
}

/// POST /api/batches/{batch_id}/items response
#[derive(Debug, Serialize)]
pub struct SubmitItemsResponse {
    pub batch_id: String,
    pub accepted: usize,
    pub first_position: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub include_results: bool,
}

/// POST /api/batches
///
/// Create a batch expecting `total` items. The owner is subscribed to its
/// progress events.
pub async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<CreateBatchRequest>,
) -> ApiResult<(StatusCode, Json<CreateBatchResponse>)> {
    let batch_id = state
        .orchestrator
        .start_batch(&request.client_id, request.total)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateBatchResponse {
            batch_id,
            status: BatchStatus::Pending,
        }),
    ))
}

/// POST /api/batches/{batch_id}/items
///
/// Returns 202 Accepted once positions are reserved; classification runs in
/// the background.
pub async fn submit_items(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Json(request): Json<SubmitItemsRequest>,
) -> ApiResult<(StatusCode, Json<SubmitItemsResponse>)> {
    let sources = request
        .items
        .into_iter()
        .enumerate()
        .map(|(index, item)| item.into_source(index))
        .collect::<ApiResult<Vec<_>>>()?;

    let submission = state.orchestrator.submit_items(&batch_id, sources).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitItemsResponse {
            batch_id,
            accepted: submission.accepted,
            first_position: submission.first_position,
        }),
    ))
}

/// GET /api/batches/{batch_id}
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<BatchView>> {
    let view = if query.include_results {
        state.orchestrator.get_status_with_results(&batch_id).await?
    } else {
        state.orchestrator.get_status(&batch_id).await?
    };

    Ok(Json(view))
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/batches", post(create_batch))
        .route("/api/batches/:batch_id", get(get_batch))
        .route("/api/batches/:batch_id/items", post(submit_items))
}
