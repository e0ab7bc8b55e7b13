use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use si_protocol::OrgKind;
use si_topics as topics;
use utoipa::ToSchema;

use crate::{api, auth, responses, AppState};

fn admin_gate(headers: &HeaderMap) -> Result<(), Response> {
    if auth::admin_ok(headers) {
        Ok(())
    } else {
        Err(responses::unauthorized())
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct OrgCreateReq {
    pub slug: String,
    pub name: String,
    #[schema(value_type = String)]
    pub kind: OrgKind,
}

/// Register a tenant organization.
#[utoipa::path(
    post,
    path = "/admin/orgs",
    tag = "Admin",
    request_body = OrgCreateReq,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn org_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OrgCreateReq>,
) -> Response {
    if let Err(resp) = admin_gate(&headers) {
        return resp;
    }
    match state
        .kernel()
        .insert_org_async(&req.slug, &req.name, req.kind)
        .await
    {
        Ok(org) => {
            state
                .publish(
                    topics::TOPIC_ORG_CREATED,
                    &json!({"id": org.id, "slug": org.slug, "kind": org.kind}),
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(org)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct UserCreateReq {
    pub external_id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Register a user against an identity-provider subject.
#[utoipa::path(
    post,
    path = "/admin/users",
    tag = "Admin",
    request_body = UserCreateReq,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn user_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UserCreateReq>,
) -> Response {
    if let Err(resp) = admin_gate(&headers) {
        return resp;
    }
    match state
        .kernel()
        .insert_user_async(&req.external_id, &req.name, req.email.as_deref())
        .await
    {
        Ok(user) => {
            state
                .publish(topics::TOPIC_USER_CREATED, &json!({"id": user.id}))
                .await;
            (axum::http::StatusCode::CREATED, Json(user)).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct MemberUpsertReq {
    pub user_id: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_reviewer: bool,
}

/// Attach a user to an org with role flags.
#[utoipa::path(
    post,
    path = "/admin/orgs/{id}/members",
    tag = "Admin",
    params(("id" = String, Path, description = "Org id")),
    request_body = MemberUpsertReq,
    responses(
        (status = 200, description = "Upserted", body = serde_json::Value),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn member_upsert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MemberUpsertReq>,
) -> Response {
    if let Err(resp) = admin_gate(&headers) {
        return resp;
    }
    let org_id = match api::parse_path_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let user_id = match api::parse_path_id(&req.user_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state
        .kernel()
        .upsert_org_user_async(&org_id, &user_id, req.is_admin, req.is_reviewer)
        .await
    {
        Ok(()) => {
            state
                .publish(
                    topics::TOPIC_MEMBER_UPSERTED,
                    &json!({
                        "org_id": org_id,
                        "user_id": user_id,
                        "is_admin": req.is_admin,
                        "is_reviewer": req.is_reviewer,
                    }),
                )
                .await;
            (axum::http::StatusCode::OK, Json(json!({"ok": true}))).into_response()
        }
        Err(err) => responses::internal(&err),
    }
}

/// Recent audit trail.
#[utoipa::path(get, path = "/admin/audit", tag = "Admin", responses((status = 200, body = serde_json::Value)))]
pub async fn audit_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = admin_gate(&headers) {
        return resp;
    }
    match state.kernel().list_audit_async(200).await {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(err) => responses::internal(&err),
    }
}
