use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use si_policy::{Action, ResourceKind};
use si_protocol::RunStatus;
use si_topics as topics;
use utoipa::ToSchema;

use crate::{api, responses, AppState};

/// Start a legacy run for a study.
#[utoipa::path(
    post,
    path = "/studies/{id}/runs",
    tag = "Runs",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 404, description = "Study not found")
    )
)]
pub async fn run_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
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
        api::require(&state, &principal, Action::Create, ResourceKind::StudyRun, &ctx).await
    {
        return resp;
    }
    match state.kernel().insert_run_async(&study_id).await {
        Ok(run) => {
            state
                .publish(
                    topics::TOPIC_RUN_CREATED,
                    &json!({"id": run.id, "study_id": run.study_id}),
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(run)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

/// Fetch one run.
#[utoipa::path(
    get,
    path = "/runs/{id}",
    tag = "Runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn run_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let run_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().run_org_context_async(&run_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::View, ResourceKind::StudyRun, &ctx).await
    {
        return resp;
    }
    match state.kernel().get_run_async(&run_id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => responses::not_found(),
        Err(err) => responses::internal(&err),
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct RunStatusReq {
    #[schema(value_type = String)]
    pub status: RunStatus,
}

/// Overwrite the legacy status column. Last write wins; the log-based job
/// model is the one with ordering guarantees.
#[utoipa::path(
    post,
    path = "/runs/{id}/status",
    tag = "Runs",
    params(("id" = String, Path, description = "Run id")),
    request_body = RunStatusReq,
    responses(
        (status = 200, description = "Updated", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn run_status_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RunStatusReq>,
) -> Response {
    let run_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().run_org_context_async(&run_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Operate, ResourceKind::StudyRun, &ctx).await
    {
        return resp;
    }
    match state.kernel().set_run_status_async(&run_id, req.status).await {
        Ok(true) => {
            state
                .publish(
                    topics::TOPIC_RUN_STATUS_CHANGED,
                    &json!({"id": run_id, "status": req.status}),
                )
                .await;
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => responses::not_found(),
        Err(err) => responses::internal(&err),
    }
}
