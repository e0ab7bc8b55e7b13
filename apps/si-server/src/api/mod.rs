pub mod admin;
pub mod events;
pub mod files;
pub mod jobs;
pub mod meta;
pub mod runs;
pub mod studies;

use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::json;
use si_kernel::OrgContext;
use si_policy::{Action, Principal, Resource, ResourceKind};
use si_topics as topics;

use crate::{auth, responses, AppState};

/// Resolves the caller or produces the matching error response.
pub(crate) async fn principal_or_response(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, Response> {
    match auth::resolve_principal(state, headers).await {
        Ok(Some(p)) => Ok(p),
        Ok(None) => Err(responses::unauthorized()),
        Err(err) => Err(responses::internal(&err)),
    }
}

/// Evaluates the permission predicate against a study's org context and
/// turns denials into the uniform 403 (journaling the decision).
pub(crate) async fn require(
    state: &AppState,
    principal: &Principal,
    action: Action,
    kind: ResourceKind,
    ctx: &OrgContext,
) -> Result<(), Response> {
    let resource = Resource {
        kind,
        org_id: ctx.org_id,
        submitted_by_org_id: ctx.submitted_by_org_id,
    };
    let decision = state.policy().evaluate(principal, action, &resource);
    if decision.allow {
        return Ok(());
    }
    state
        .publish(
            topics::TOPIC_POLICY_DECISION,
            &json!({
                "user_id": principal.user_id,
                "action": action.as_str(),
                "allow": false,
                "explain": decision.explain.clone(),
            }),
        )
        .await;
    Err(responses::forbidden(decision.explain))
}

/// Path ids arrive as canonical UUIDs or the compact base64url form; the
/// kernel always sees the canonical string.
pub(crate) fn parse_path_id(raw: &str) -> Result<String, Response> {
    si_protocol::parse_id(raw)
        .map(|u| u.to_string())
        .map_err(|_| responses::bad_request("invalid record id"))
}
