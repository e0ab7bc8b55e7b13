use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use si_policy::{Action, ResourceKind};
use si_protocol::Page;
use si_topics as topics;
use utoipa::ToSchema;

use crate::{api, responses, AppState};

#[derive(Deserialize, ToSchema)]
pub(crate) struct StudyCreateReq {
    pub title: String,
    /// Reviewing enclave org.
    pub org_id: String,
    /// Originating lab org.
    pub submitted_by_org_id: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description_doc: Option<String>,
    #[serde(default)]
    pub irb_doc: Option<String>,
    #[serde(default)]
    pub agreement_doc: Option<String>,
}

/// Create a draft study proposal.
#[utoipa::path(
    post,
    path = "/studies",
    tag = "Studies",
    request_body = StudyCreateReq,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 403, description = "Forbidden")
    )
)]
pub async fn study_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StudyCreateReq>,
) -> Response {
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let org_id = match si_protocol::parse_id(&req.org_id) {
        Ok(v) => v,
        Err(_) => return responses::bad_request("invalid org id"),
    };
    let submitted_by = match si_protocol::parse_id(&req.submitted_by_org_id) {
        Ok(v) => v,
        Err(_) => return responses::bad_request("invalid submitting org id"),
    };
    // The study does not exist yet; permission is judged on the org pair
    // the proposal names.
    let ctx = si_kernel::OrgContext {
        study_id: uuid::Uuid::nil(),
        org_id,
        submitted_by_org_id: submitted_by,
    };
    if let Err(resp) = api::require(&state, &principal, Action::Create, ResourceKind::Study, &ctx).await
    {
        return resp;
    }

    let researcher_id = principal.user_id.to_string();
    match state
        .kernel()
        .insert_study_async(
            &req.title,
            &researcher_id,
            &org_id.to_string(),
            &submitted_by.to_string(),
            req.language.as_deref(),
            req.description_doc.as_deref(),
            req.irb_doc.as_deref(),
            req.agreement_doc.as_deref(),
        )
        .await
    {
        Ok(study) => {
            state
                .publish(
                    topics::TOPIC_STUDY_CREATED,
                    &json!({"id": study.id, "org_id": study.org_id, "title": study.title}),
                )
                .await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&researcher_id),
                    "study.create",
                    "study",
                    Some(&study.id),
                    Some(json!({"title": study.title})),
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(study)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

/// Studies visible to the caller's orgs.
#[utoipa::path(get, path = "/studies", tag = "Studies", responses((status = 200, body = serde_json::Value)))]
pub async fn studies_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let org_ids: Vec<String> = principal
        .memberships
        .iter()
        .map(|m| m.org_id.to_string())
        .collect();
    match state
        .kernel()
        .list_studies_for_orgs_async(org_ids, 200)
        .await
    {
        Ok(items) => Json(Page {
            items,
            next_cursor: None,
        })
        .into_response(),
        Err(err) => responses::internal(&err),
    }
}

/// Fetch one study.
#[utoipa::path(
    get,
    path = "/studies/{id}",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 200, description = "Study", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn study_get(
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
    let ctx = match state.kernel().study_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) = api::require(&state, &principal, Action::View, ResourceKind::Study, &ctx).await
    {
        return resp;
    }
    match state.kernel().get_study_async(&id).await {
        Ok(Some(study)) => Json(study).into_response(),
        Ok(None) => responses::not_found(),
        Err(err) => responses::internal(&err),
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct StudyUpdateReq {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description_doc: Option<String>,
    #[serde(default)]
    pub irb_doc: Option<String>,
    #[serde(default)]
    pub agreement_doc: Option<String>,
}

/// Edit a study while it is still a draft.
#[utoipa::path(
    patch,
    path = "/studies/{id}",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    request_body = StudyUpdateReq,
    responses(
        (status = 200, description = "Updated", body = serde_json::Value),
        (status = 409, description = "Not a draft")
    )
)]
pub async fn study_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StudyUpdateReq>,
) -> Response {
    let id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().study_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Update, ResourceKind::Study, &ctx).await
    {
        return resp;
    }
    match state
        .kernel()
        .update_study_draft_async(
            &id,
            req.title,
            req.language,
            req.description_doc,
            req.irb_doc,
            req.agreement_doc,
        )
        .await
    {
        Ok(true) => {
            state
                .publish(topics::TOPIC_STUDY_UPDATED, &json!({"id": id}))
                .await;
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => responses::conflict("study is no longer a draft"),
        Err(err) => responses::internal(&err),
    }
}

/// Move a draft into review.
#[utoipa::path(
    post,
    path = "/studies/{id}/submit",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 200, description = "Submitted", body = serde_json::Value),
        (status = 409, description = "Not a draft")
    )
)]
pub async fn study_submit(
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
    let ctx = match state.kernel().study_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Submit, ResourceKind::Study, &ctx).await
    {
        return resp;
    }
    match state.kernel().submit_study_async(&id).await {
        Ok(true) => {
            state
                .publish(topics::TOPIC_STUDY_SUBMITTED, &json!({"id": id}))
                .await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&principal.user_id.to_string()),
                    "study.submit",
                    "study",
                    Some(&id),
                    None,
                )
                .await;
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => responses::conflict("study is not a draft"),
        Err(err) => responses::internal(&err),
    }
}

async fn decide(state: AppState, id: String, headers: HeaderMap, approve: bool) -> Response {
    let id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let principal = match api::principal_or_response(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let ctx = match state.kernel().study_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Review, ResourceKind::Study, &ctx).await
    {
        return resp;
    }
    match state.kernel().decide_study_async(&id, approve).await {
        Ok(true) => {
            let topic = if approve {
                topics::TOPIC_STUDY_APPROVED
            } else {
                topics::TOPIC_STUDY_REJECTED
            };
            state.publish(topic, &json!({"id": id})).await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&principal.user_id.to_string()),
                    if approve { "study.approve" } else { "study.reject" },
                    "study",
                    Some(&id),
                    None,
                )
                .await;
            match state.kernel().get_study_async(&id).await {
                Ok(Some(study)) => Json(study).into_response(),
                Ok(None) => responses::not_found(),
                Err(err) => responses::internal(&err),
            }
        }
        // The study exists (the context resolved); a failed guard means a
        // decision already landed or the study never left draft.
        Ok(false) => responses::conflict("study is not pending review"),
        Err(err) => responses::internal(&err),
    }
}

/// Approve a pending study.
#[utoipa::path(
    post,
    path = "/studies/{id}/approve",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 200, description = "Approved", body = serde_json::Value),
        (status = 409, description = "Already decided")
    )
)]
pub async fn study_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    decide(state, id, headers, true).await
}

/// Reject a pending study.
#[utoipa::path(
    post,
    path = "/studies/{id}/reject",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 200, description = "Rejected", body = serde_json::Value),
        (status = 409, description = "Already decided")
    )
)]
pub async fn study_reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    decide(state, id, headers, false).await
}

/// Delete a study and purge its artifacts.
#[utoipa::path(
    delete,
    path = "/studies/{id}",
    tag = "Studies",
    params(("id" = String, Path, description = "Study id")),
    responses(
        (status = 200, description = "Deleted", body = serde_json::Value),
        (status = 404, description = "Not found")
    )
)]
pub async fn study_delete(
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
    let ctx = match state.kernel().study_org_context_async(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return responses::not_found(),
        Err(err) => return responses::internal(&err),
    };
    if let Err(resp) =
        api::require(&state, &principal, Action::Delete, ResourceKind::Study, &ctx).await
    {
        return resp;
    }
    match state.kernel().delete_study_cascade_async(&id).await {
        Ok(Some(shas)) => {
            let purged = shas.len();
            for sha in shas {
                if let Err(err) = si_kernel::Kernel::cas_delete(state.state_dir(), &sha).await {
                    tracing::warn!(target: "files", "blob purge failed for {sha}: {err:?}");
                }
            }
            state
                .publish(topics::TOPIC_STUDY_DELETED, &json!({"id": id}))
                .await;
            let _ = state
                .kernel()
                .append_audit_async(
                    Some(&principal.user_id.to_string()),
                    "study.delete",
                    "study",
                    Some(&id),
                    Some(json!({"purged_blobs": purged})),
                )
                .await;
            Json(json!({"ok": true, "purged_blobs": purged})).into_response()
        }
        Ok(None) => responses::not_found(),
        Err(err) => responses::internal(&err),
    }
}
