use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use si_kernel::TransitionOutcome;
use si_policy::{Action, ResourceKind};
use si_protocol::JobStatus;
use si_topics as topics;
use utoipa::ToSchema;

use crate::{api, responses, sim, AppState};

#[derive(Deserialize, ToSchema)]
pub(crate) struct JobCreateReq {
    #[serde(default)]
    pub language: Option<String>,
}

/// Start a new code-submission cycle for a study.
#[utoipa::path(
    post,
    path = "/studies/{id}/jobs",
    tag = "Jobs",
    params(("id" = String, Path, description = "Study id")),
    request_body = JobCreateReq,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 404, description = "Study not found")
    )
)]
pub async fn job_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<JobCreateReq>,
) -> Response {
    let study_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().study_org_context_async(&study_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Create, ResourceKind::StudyJob, &ctx).await
    {
        return resp;
    }
    let user_id = principal.user_id.to_string();
    match state
        .kernel()
        .insert_job_async(&study_id, req.language.as_deref(), Some(&user_id))
        .await
    {
        Ok(job) => {
            state
                .publish(
                    topics::TOPIC_JOB_CREATED,
                    &json!({"id": job.id, "study_id": job.study_id}),
                )
                .await;
            let _ = state
                .kernel()
                .append_audit_async(Some(&user_id), "job.create", "study_job", Some(&job.id), None)
                .await;
            (axum::http::StatusCode::CREATED, Json(job)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

/// A job with its derived status snapshot.
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    tag = "Jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn job_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::View, ResourceKind::StudyJob, &ctx).await
    {
        return resp;
    }
    let job = match state.kernel().get_job_async(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    match state.kernel().job_snapshot_async(&id).await {
        Ok(Some(snapshot)) => Json(json!({"job": job, "status": snapshot})).into_response(),
        Ok(None) => responses::not_found(),
        Err(err) => responses::internal(&err),
    }
}

/// Ordered status history for a job.
#[utoipa::path(
    get,
    path = "/jobs/{id}/statuses",
    tag = "Jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "History", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn job_statuses(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::View, ResourceKind::StudyJob, &ctx).await
    {
        return resp;
    }
    match state.kernel().list_status_changes_async(&id).await {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(err) => responses::internal(&err),
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct JobStatusReq {
    #[schema(value_type = String)]
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// Append one status transition to a job's log.
#[utoipa::path(
    post,
    path = "/jobs/{id}/status",
    tag = "Jobs",
    params(("id" = String, Path, description = "Job id")),
    request_body = JobStatusReq,
    responses(
        (status = 200, description = "Applied", body = serde_json::Value),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not found"),
        (status = 409, description = "Illegal transition")
    )
)]
pub async fn job_status_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<JobStatusReq>,
) -> Response {
    let id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    let action = si_lifecycle::required_action(req.status);
    if let Err(resp) = api::require(&state, &principal, action, ResourceKind::StudyJob, &ctx).await {
        return resp;
    }

    let user_id = principal.user_id.to_string();
    match state
        .kernel()
        .append_job_status_async(&id, req.status, req.message.as_deref(), Some(&user_id))
        .await
    {
        Ok(TransitionOutcome::Applied(row)) => {
            state
                .publish(
                    topics::TOPIC_JOB_STATUS_CHANGED,
                    &json!({
                        "job_id": id,
                        "study_id": ctx.study_id,
                        "status": row.status,
                        "message": row.message,
                    }),
                )
                .await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&user_id),
                    "job.status",
                    "study_job",
                    Some(&id),
                    Some(json!({"status": row.status})),
                )
                .await;
            if req.status == JobStatus::JobRunning && sim::simulate_enabled() {
                sim::spawn_results_simulation(state.clone(), id.clone());
            }
            Json(json!({"ok": true, "id": row.id, "status": row.status})).into_response()
        }
        Ok(TransitionOutcome::Rejected(reason)) => responses::conflict(&reason.to_string()),
        Err(err) => responses::internal(&err),
    }
}
