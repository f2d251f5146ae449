//! REST job surface
//!
//! Routes REST paths onto scheduler and directory operations. Bulk
//! operations act by constraint and report outcome totals; single-job
//! operations translate classic scheduler error strings into HTTP codes.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::router::AppState;
use crate::cluster::attributes::render_attributes;
use crate::cluster::{JobAction, JobId, SecurityContext, classify_scheduler_error};
use crate::failsafe::with_read_retry;
use crate::{Error, Result};

/// Failure wrapper rendering `{error, message, code}` bodies
#[derive(Debug)]
pub(crate) struct ApiFailure(pub Error);

impl From<Error> for ApiFailure {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn error_kind(e: &Error) -> &'static str {
    match e {
        Error::Config(_) => "config",
        Error::Protocol(_) | Error::Json(_) => "protocol",
        Error::Authentication(_) | Error::InactiveToken(_) => "authentication",
        Error::InsufficientScope(_) => "forbidden",
        Error::NotFound(_) => "not_found",
        Error::Conflict(_) => "conflict",
        Error::RateLimited { .. } => "rate_limited",
        Error::Upstream(_) | Error::Http(_) => "upstream",
        Error::UpstreamTimeout(_) => "upstream_timeout",
        _ => "internal",
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.0.status();
        // Internal detail is logged, never surfaced
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = Json(json!({
            "error": error_kind(&self.0),
            "message": message,
            "code": status.as_u16(),
        }));
        if let Error::RateLimited { retry_after } = &self.0 {
            (status, [("retry-after", retry_after.to_string())], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Reclassify scheduler-reported error strings for single-job operations
fn reclassify(e: Error) -> Error {
    match e {
        Error::Internal(message) => classify_scheduler_error(&message),
        other => other,
    }
}

/// REST routes; sandbox uploads get their own body limit
pub fn routes(sandbox_max_bytes: u64) -> Router<Arc<AppState>> {
    let upload_limit = usize::try_from(sandbox_max_bytes).unwrap_or(usize::MAX);
    Router::new()
        .route(
            "/api/v1/jobs",
            get(list_jobs)
                .post(submit_job)
                .delete(bulk_remove)
                .patch(bulk_edit),
        )
        .route("/api/v1/jobs/hold", post(bulk_hold))
        .route("/api/v1/jobs/release", post(bulk_release))
        .route(
            "/api/v1/jobs/{id}",
            get(get_job).delete(remove_job).patch(edit_job),
        )
        .route("/api/v1/jobs/{id}/hold", post(hold_job))
        .route("/api/v1/jobs/{id}/release", post(release_job))
        .route(
            "/api/v1/jobs/{id}/input",
            put(upload_input).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/v1/jobs/{id}/output", get(download_output))
        .route("/api/v1/directory/ads", get(query_ads_root))
        .route("/api/v1/directory/ads/{ad_type}", get(query_ads_typed))
        .route("/api/v1/directory/ads/{ad_type}/{name}", get(query_ads_named))
}

// ----------------------------------------------------------------------
// Jobs: list / submit
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    constraint: Option<String>,
    /// Comma-separated attribute projection
    #[serde(default)]
    projection: Option<String>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Query(params): Query<ListParams>,
) -> std::result::Result<Json<Vec<Value>>, ApiFailure> {
    let constraint = params.constraint.as_deref().unwrap_or("true").to_string();
    let projection: Vec<String> = params
        .projection
        .as_deref()
        .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let scheduler = Arc::clone(&state.scheduler);
    let jobs = with_read_retry("list_jobs", || {
        let scheduler = Arc::clone(&scheduler);
        let ctx = ctx.clone();
        let constraint = constraint.clone();
        let projection = projection.clone();
        async move { scheduler.query_jobs(&ctx, &constraint, &projection).await }
    })
    .await?;
    Ok(Json(jobs))
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(description): Json<Value>,
) -> std::result::Result<(StatusCode, Json<Value>), ApiFailure> {
    let id = state
        .scheduler
        .submit_job(&ctx, description)
        .await
        .map_err(reclassify)?;
    debug!(subject = %ctx.subject, job_id = %id, "Job submitted");
    Ok((StatusCode::CREATED, Json(json!({"job_id": id.to_string()}))))
}

// ----------------------------------------------------------------------
// Bulk operations
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BulkBody {
    #[serde(default)]
    constraint: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
}

fn require_constraint(body: &BulkBody) -> Result<()> {
    if body.constraint.trim().is_empty() {
        return Err(Error::Protocol("constraint is required".to_string()));
    }
    Ok(())
}

fn bulk_response(
    verb: &str,
    constraint: &str,
    totals: crate::cluster::ActionTotals,
) -> std::result::Result<Json<Value>, ApiFailure> {
    if totals.total == 0 {
        return Err(ApiFailure(Error::NotFound(
            "No jobs matched the constraint".to_string(),
        )));
    }
    Ok(Json(json!({
        "message": format!("{verb} {} of {} matched jobs", totals.success, totals.total),
        "constraint": constraint,
        "results": totals,
    })))
}

async fn bulk_action(
    state: &AppState,
    ctx: &SecurityContext,
    body: &BulkBody,
    action: JobAction,
    verb: &str,
) -> std::result::Result<Json<Value>, ApiFailure> {
    require_constraint(body)?;
    let totals = state
        .scheduler
        .act_on_constraint(ctx, &body.constraint, action, body.reason.as_deref())
        .await?;
    bulk_response(verb, &body.constraint, totals)
}

async fn bulk_remove(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(body): Json<BulkBody>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    bulk_action(&state, &ctx, &body, JobAction::Remove, "Removed").await
}

async fn bulk_hold(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(body): Json<BulkBody>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    bulk_action(&state, &ctx, &body, JobAction::Hold, "Held").await
}

async fn bulk_release(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(body): Json<BulkBody>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    bulk_action(&state, &ctx, &body, JobAction::Release, "Released").await
}

async fn bulk_edit(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(body): Json<BulkBody>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    require_constraint(&body)?;
    let attributes = body
        .attributes
        .as_ref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::Protocol("attributes is required".to_string()))?;
    let rendered = render_attributes(attributes);
    let totals = state
        .scheduler
        .edit_constraint(&ctx, &body.constraint, &rendered)
        .await?;
    bulk_response("Edited", &body.constraint, totals)
}

// ----------------------------------------------------------------------
// Single-job operations
// ----------------------------------------------------------------------

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse()
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let id = parse_id(&id)?;
    let ad = state
        .scheduler
        .get_job(&ctx, id)
        .await
        .map_err(reclassify)?;
    Ok(Json(ad))
}

async fn remove_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let id = parse_id(&id)?;
    state
        .scheduler
        .act_on_job(&ctx, id, JobAction::Remove, None)
        .await
        .map_err(reclassify)?;
    Ok(Json(json!({"job_id": id.to_string(), "status": "removed"})))
}

#[derive(Debug, Deserialize)]
struct EditBody {
    attributes: Map<String, Value>,
}

async fn edit_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
    Json(body): Json<EditBody>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let id = parse_id(&id)?;
    if body.attributes.is_empty() {
        return Err(ApiFailure(Error::Protocol(
            "attributes is required".to_string(),
        )));
    }
    let rendered = render_attributes(&body.attributes);
    state
        .scheduler
        .edit_job(&ctx, id, &rendered)
        .await
        .map_err(reclassify)?;
    Ok(Json(json!({"job_id": id.to_string(), "status": "edited"})))
}

#[derive(Debug, Default, Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn job_action(
    state: &AppState,
    ctx: &SecurityContext,
    raw_id: &str,
    action: JobAction,
    reason: Option<&str>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let id = parse_id(raw_id)?;
    state
        .scheduler
        .act_on_job(ctx, id, action, reason)
        .await
        .map_err(reclassify)?;
    Ok(Json(json!({
        "job_id": id.to_string(),
        "status": action.as_str(),
    })))
}

async fn hold_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
    body: Option<Json<ReasonBody>>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let reason = body.and_then(|Json(b)| b.reason);
    job_action(&state, &ctx, &id, JobAction::Hold, reason.as_deref()).await
}

async fn release_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
    body: Option<Json<ReasonBody>>,
) -> std::result::Result<Json<Value>, ApiFailure> {
    let reason = body.and_then(|Json(b)| b.reason);
    job_action(&state, &ctx, &id, JobAction::Release, reason.as_deref()).await
}

// ----------------------------------------------------------------------
// Sandboxes
// ----------------------------------------------------------------------

async fn upload_input(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
    tar: Bytes,
) -> std::result::Result<StatusCode, ApiFailure> {
    let id = parse_id(&id)?;
    if tar.is_empty() {
        return Err(ApiFailure(Error::Protocol(
            "sandbox body is required".to_string(),
        )));
    }
    state
        .scheduler
        .upload_sandbox(&ctx, id, tar)
        .await
        .map_err(reclassify)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_output(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiFailure> {
    let id = parse_id(&id)?;
    let reader = state
        .scheduler
        .download_sandbox(&ctx, id)
        .await
        .map_err(reclassify)?;
    let stream = ReaderStream::new(reader);
    let response = (
        [("content-type", "application/x-tar")],
        Body::from_stream(stream),
    )
        .into_response();
    Ok(response)
}

// ----------------------------------------------------------------------
// Directory ads (unauthenticated)
// ----------------------------------------------------------------------

async fn query_ads(
    state: &AppState,
    ad_type: Option<String>,
    name: Option<String>,
) -> std::result::Result<Json<Vec<Value>>, ApiFailure> {
    let Some(directory) = &state.directory else {
        return Err(ApiFailure(Error::Upstream(
            "directory is not configured".to_string(),
        )));
    };
    let directory = Arc::clone(directory);
    let ads = with_read_retry("query_ads", || {
        let directory = Arc::clone(&directory);
        let ad_type = ad_type.clone();
        let name = name.clone();
        async move { directory.query_ads(ad_type.as_deref(), name.as_deref()).await }
    })
    .await?;
    Ok(Json(ads))
}

async fn query_ads_root(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<Vec<Value>>, ApiFailure> {
    query_ads(&state, None, None).await
}

async fn query_ads_typed(
    State(state): State<Arc<AppState>>,
    Path(ad_type): Path<String>,
) -> std::result::Result<Json<Vec<Value>>, ApiFailure> {
    query_ads(&state, Some(ad_type), None).await
}

async fn query_ads_named(
    State(state): State<Arc<AppState>>,
    Path((ad_type, name)): Path<(String, String)>,
) -> std::result::Result<Json<Vec<Value>>, ApiFailure> {
    query_ads(&state, Some(ad_type), Some(name)).await
}
