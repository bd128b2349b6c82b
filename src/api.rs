//! HTTP surface for the upload/compress service.

use crate::error::{ApiError, ApiResult};
use crate::jobs::JobManager;
use crate::metrics::{get_memory_usage_bytes, MetricsCollector};
use crate::upload::{UploadError, UploadManager};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadManager>,
    pub jobs: Arc<JobManager>,
    pub metrics: Arc<MetricsCollector>,
}

#[derive(Debug, Deserialize)]
pub struct InitiateUploadRequest {
    total_size: u64,
    chunk_count: u32,
    #[serde(default)]
    quality: Option<crate::config::QualityPreset>,
}

/// API Routes
pub fn routes(state: AppState) -> Router {
    // Transport ceiling: no request body may exceed one chunk plus its
    // multipart framing.
    let body_cap = state.uploads.limits().max_chunk_size + crate::config::MULTIPART_OVERHEAD;
    Router::new()
        .route("/", get(root))
        .route("/api/uploads", post(initiate_upload))
        .route("/api/uploads/:id/chunks/:index", post(submit_chunk))
        .route("/api/uploads/:id/finalize", post(finalize_upload))
        .route("/api/jobs/:id", get(job_status))
        .route("/api/jobs/:id/result", get(job_result))
        .route("/stats", get(get_stats))
        .layer(axum::extract::DefaultBodyLimit::max(body_cap))
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "pdfpress",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Chunked-upload PDF compression service"
    }))
}

async fn initiate_upload(
    State(state): State<AppState>,
    Json(req): Json<InitiateUploadRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let quality = req
        .quality
        .unwrap_or(state.uploads.limits().default_quality);
    let id = state
        .uploads
        .initiate(req.total_size, req.chunk_count, quality)
        .await?;
    state.metrics.record_upload_initiated();

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "session_id": id,
            "chunk_count": req.chunk_count,
            "quality": quality.as_str(),
        })),
    ))
}

/// Pull the `chunk` field out of a multipart body, aborting as soon as
/// the field crosses the per-chunk ceiling instead of buffering an
/// unbounded payload first.
async fn read_chunk_field(
    mut multipart: axum_extra::extract::Multipart,
    limit: usize,
) -> Result<Bytes, ApiError> {
    while let Ok(Some(mut field)) = multipart.next_field().await {
        if field.name() != Some("chunk") {
            continue;
        }
        let mut buf = Vec::new();
        while let Some(piece) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable chunk field: {}", e)))?
        {
            if buf.len() + piece.len() > limit {
                return Err(UploadError::ChunkTooLarge {
                    size: buf.len() + piece.len(),
                    limit,
                }
                .into());
            }
            buf.extend_from_slice(&piece);
        }
        return Ok(Bytes::from(buf));
    }
    Err(ApiError::BadRequest("missing 'chunk' field".to_string()))
}

async fn submit_chunk(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, u32)>,
    multipart: axum_extra::extract::Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let bytes = read_chunk_field(multipart, state.uploads.limits().max_chunk_size).await?;
    let next = state.uploads.submit_chunk(&id, index, &bytes).await?;
    state.metrics.record_chunk_accepted();

    Ok(Json(serde_json::json!({
        "accepted": index,
        "next_chunk": next,
    })))
}

async fn finalize_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let handoff = state.uploads.finalize(&id).await?;
    let job_id = state.jobs.launch(handoff);

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let view = state.jobs.status(&id)?;

    let mut body = serde_json::json!({
        "status": view.status.as_str(),
        "progress": view.progress,
        "original_size": view.original_size,
    });
    if let Some(final_size) = view.final_size {
        body["final_size"] = serde_json::json!(final_size);
    }
    if let Some(failure) = view.failure {
        body["failure"] = serde_json::json!({
            "code": failure.code,
            "message": failure.message,
        });
    }
    Ok(Json(body))
}

async fn job_result(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let result = state.jobs.take_result(&id)?;

    let file = tokio::fs::File::open(&result.output_path)
        .await
        .map_err(|e| ApiError::Job(crate::jobs::JobError::StreamDelivery(e)))?;

    // The scratch guard rides in the stream state: it drops (and the dir
    // is released) when the body finishes or the client disconnects. A
    // partially-delivered result is not retryable either way, since the
    // job record is already gone.
    let scratch = result.scratch;
    let stream = futures::stream::unfold((file, scratch), |(mut file, scratch)| async move {
        let mut buf = vec![0u8; crate::config::STREAM_BUF_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (file, scratch)))
            }
            Err(e) => Some((Err(e), (file, scratch))),
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"compressed.pdf\"",
        )
        .header(header::CONTENT_LENGTH, result.final_size)
        .header("X-Original-Size", result.original_size)
        .header("X-Compressed-Size", result.final_size)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(response)
}

async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    use std::sync::atomic::Ordering;
    let m = &state.metrics;

    Json(serde_json::json!({
        "uploads_initiated": m.uploads_initiated.load(Ordering::Relaxed),
        "chunks_accepted": m.chunks_accepted.load(Ordering::Relaxed),
        "jobs_launched": m.jobs_launched.load(Ordering::Relaxed),
        "jobs_succeeded": m.jobs_succeeded.load(Ordering::Relaxed),
        "jobs_failed": m.jobs_failed.load(Ordering::Relaxed),
        "active_sessions": state.uploads.active_sessions(),
        "active_jobs": state.jobs.active_jobs(),
        "compress_latency_avg_ms": m.get_avg_latency(),
        "compress_latency_p99_ms": m.get_p99_latency(),
        "latency_samples": m.get_sample_count(),
        "memory_usage_bytes": get_memory_usage_bytes(),
    }))
}
