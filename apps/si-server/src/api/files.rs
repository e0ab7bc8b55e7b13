use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use si_kernel::{Kernel, TransitionOutcome};
use si_lifecycle::visible_to_submitter;
use si_policy::{Action, ResourceKind};
use si_protocol::{FileType, JobStatus};
use si_topics as topics;
use utoipa::ToSchema;

use crate::{api, responses, AppState};

#[derive(Deserialize, ToSchema)]
pub(crate) struct FileUploadReq {
    #[schema(value_type = String)]
    pub file_type: FileType,
    pub name: String,
    /// Raw artifact bytes, base64-encoded.
    pub content_b64: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Attach an artifact to a job. Code comes from the lab, encrypted outputs
/// from the enclave side; `APPROVED-*` rows are minted only by approval.
#[utoipa::path(
    post,
    path = "/jobs/{id}/files",
    tag = "Files",
    params(("id" = String, Path, description = "Job id")),
    request_body = FileUploadReq,
    responses(
        (status = 201, description = "Stored", body = serde_json::Value),
        (status = 400, description = "Invalid payload"),
        (status = 404, description = "Job not found")
    )
)]
pub async fn file_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FileUploadReq>,
) -> Response {
    let job_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&job_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    let action = if req.file_type.is_code() {
        Action::Update
    } else if req.file_type.is_encrypted() {
        Action::Operate
    } else {
        return responses::bad_request("approved artifacts are minted by the approval action");
    };
    if let Err(resp) = api::require(&state, &principal, action, ResourceKind::JobFile, &ctx).await {
        return resp;
    }

    let bytes = match BASE64_STD.decode(req.content_b64.as_bytes()) {
        Ok(b) => b,
        Err(_) => return responses::bad_request("content_b64 is not valid base64"),
    };
    let sha = match Kernel::cas_put(&bytes, req.content_type.as_deref(), state.state_dir()).await {
        Ok(sha) => sha,
        Err(err) => return responses::internal(&err),
    };
    match state
        .kernel()
        .insert_job_file_async(
            &job_id,
            req.file_type.as_str(),
            &req.name,
            &sha,
            req.content_type.as_deref(),
        )
        .await
    {
        Ok(row) => {
            state
                .publish(
                    topics::TOPIC_JOB_FILE_ADDED,
                    &json!({"id": row.id, "job_id": job_id, "file_type": row.file_type}),
                )
                .await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&principal.user_id.to_string()),
                    "job.file.add",
                    "study_job_file",
                    Some(&row.id),
                    Some(json!({"file_type": row.file_type, "name": row.name})),
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(row)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

/// Artifacts for a job, filtered by the caller's side of the tenancy line.
#[utoipa::path(
    get,
    path = "/jobs/{id}/files",
    tag = "Files",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Listing", body = serde_json::Value),
        (status = 404, description = "Job not found")
    )
)]
pub async fn files_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let job_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&job_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) = api::require(&state, &principal, Action::View, ResourceKind::JobFile, &ctx).await
    {
        return resp;
    }
    let rows = match state.kernel().list_job_files_async(&job_id).await {
        Ok(rows) => rows,
        Err(err) => return responses::internal(&err),
    };
    // Reviewing-org members see everything; the lab side goes through the
    // visibility rule.
    if principal.membership(ctx.org_id).is_some() {
        return Json(json!({"items": rows})).into_response();
    }
    let snapshot = match state.kernel().job_snapshot_async(&job_id).await {
        Ok(Some(snap)) => snap,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    let items: Vec<_> = rows
        .into_iter()
        .filter(|row| {
            FileType::parse(&row.file_type)
                .map(|ft| visible_to_submitter(ft, &snapshot))
                .unwrap_or(false)
        })
        .collect();
    Json(json!({"items": items})).into_response()
}

/// Release results to the lab: mint `APPROVED-*` counterparts and append
/// the FILES-APPROVED transition.
#[utoipa::path(
    post,
    path = "/jobs/{id}/results/approve",
    tag = "Files",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Approved", body = serde_json::Value),
        (status = 409, description = "Job not awaiting a decision")
    )
)]
pub async fn results_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    decide_results(state, id, headers, true).await
}

/// Withhold results: append the FILES-REJECTED transition.
#[utoipa::path(
    post,
    path = "/jobs/{id}/results/reject",
    tag = "Files",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Rejected", body = serde_json::Value),
        (status = 409, description = "Job not awaiting a decision")
    )
)]
pub async fn results_reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    decide_results(state, id, headers, false).await
}

async fn decide_results(state: AppState, id: String, headers: HeaderMap, approve: bool) -> Response {
    let job_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().job_org_context_async(&job_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) = api::require(&state, &principal, Action::Review, ResourceKind::JobFile, &ctx).await
    {
        return resp;
    }

    let user_id = principal.user_id.to_string();
    let target = if approve {
        JobStatus::FilesApproved
    } else {
        JobStatus::FilesRejected
    };
    // The guarded append is the gate: FILES-* is only reachable from
    // RUN-COMPLETE, so minting happens iff the transition lands.
    let row = match state
        .kernel()
        .append_job_status_async(&job_id, target, None, Some(&user_id))
        .await
    {
        Ok(TransitionOutcome::Applied(row)) => row,
        Ok(TransitionOutcome::Rejected(reason)) => {
            return responses::conflict(&reason.to_string())
        }
        Err(err) => return responses::internal(&err),
    };

    let mut minted = 0usize;
    if approve {
        let files = match state.kernel().list_job_files_async(&job_id).await {
            Ok(rows) => rows,
            Err(err) => return responses::internal(&err),
        };
        for file in files {
            let Some(ft) = FileType::parse(&file.file_type) else {
                continue;
            };
            let Some(counterpart) = ft.approved_counterpart() else {
                continue;
            };
            match state
                .kernel()
                .insert_job_file_async(
                    &job_id,
                    counterpart.as_str(),
                    &file.name,
                    &file.sha256,
                    file.content_type.as_deref(),
                )
                .await
            {
                Ok(_) => minted += 1,
                Err(err) => {
                    tracing::warn!(target: "files", "approved counterpart insert failed: {err:?}")
                }
            }
        }
    }

    let topic = if approve {
        topics::TOPIC_JOB_RESULTS_APPROVED
    } else {
        topics::TOPIC_JOB_RESULTS_REJECTED
    };
    state
        .publish(topic, &json!({"job_id": job_id, "study_id": ctx.study_id}))
        .await;
    state
        .publish(
            topics::TOPIC_JOB_STATUS_CHANGED,
            &json!({"job_id": job_id, "study_id": ctx.study_id, "status": row.status}),
        )
        .await;
    let _ = state
        .kernel()
        .append_audit_async(
            Some(&user_id),
            if approve { "job.results.approve" } else { "job.results.reject" },
            "study_job",
            Some(&job_id),
            Some(json!({"minted": minted})),
        )
        .await;
    Json(json!({"ok": true, "status": row.status, "approved_files": minted})).into_response()
}

/// Stream one artifact's bytes, subject to the visibility rule.
#[utoipa::path(
    get,
    path = "/dl/{id}",
    tag = "Files",
    params(("id" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "Bytes"),
        (status = 404, description = "Missing or withheld")
    )
)]
pub async fn file_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let file_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let file = match state.kernel().get_job_file_async(&file_id).await {
        Ok(Some(file)) => file,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    let ctx = match state.kernel().job_org_context_async(&file.study_job_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) = api::require(&state, &principal, Action::View, ResourceKind::JobFile, &ctx).await
    {
        return resp;
    }
    if principal.membership(ctx.org_id).is_none() {
        // Lab side: encrypted artifacts stay invisible until approval.
        // Withheld means 404; existence is not confirmed.
        let snapshot = match state.kernel().job_snapshot_async(&file.study_job_id).await {
            Ok(Some(snap)) => snap,
            Ok(None) => return responses::not_found(),
            Err(err) => return responses::internal(&err),
        };
        let visible = FileType::parse(&file.file_type)
            .map(|ft| visible_to_submitter(ft, &snapshot))
            .unwrap_or(false);
        if !visible {
            return responses::not_found();
        }
    }

    let bytes = match Kernel::cas_read(state.state_dir(), &file.sha256).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    let content_type = file
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    (
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.name),
            ),
        ],
        bytes,
    )
        .into_response()
}
