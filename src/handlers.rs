use crate::{
    error::AppError,
    models::{
        EnqueueResponse, QueueItem, QueueListing, Source, Submission, VideoInfoRequest,
        VideoInfoResponse,
    },
    store::read_json_or_default,
    AppState,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

// ===================================================================
//                          HEALTH HANDLER
// ===================================================================

/// # GET /api/health - Liveness probe for the browser extension.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok", "message": "API server is running" })))
}

// ===================================================================
//                          QUEUE HANDLERS
// ===================================================================

/// # POST /api/add-to-queue - Validates a URL and posts it to the mailbox.
///
/// The manager process picks the item up on its next sync tick.
pub async fn add_to_queue(
    State(state): State<AppState>,
    Json(payload): Json<Submission>,
) -> Result<impl IntoResponse, AppError> {
    let item = state
        .intake
        .prepare(payload, Source::Remote)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    state.mailbox.post(&item)?;
    tracing::info!("Queued from API: {} ({})", item.title, item.url);

    Ok((StatusCode::OK, Json(EnqueueResponse {
        status: "success",
        message: format!("Video added to queue: {}", item.title),
        queue_item: item,
    })))
}

/// # GET /api/get-queue - Read-only view of the queue snapshot plus undrained submissions.
pub async fn get_queue(State(state): State<AppState>) -> impl IntoResponse {
    let queue: Vec<QueueItem> = read_json_or_default(&state.snapshot);
    let pending = state.mailbox.pending();
    (StatusCode::OK, Json(QueueListing { status: "success", queue, pending }))
}

/// # POST /api/get-video-info - Resolves the display title for a URL.
pub async fn get_video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (url, title) = state
        .intake
        .lookup_title(&payload.url)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok((StatusCode::OK, Json(VideoInfoResponse { status: "success", title, url })))
}
