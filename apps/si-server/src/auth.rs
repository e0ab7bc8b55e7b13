use anyhow::Result;
use axum::http::HeaderMap;
use sha2::Digest as _;
use si_policy::{Membership, Principal};
use uuid::Uuid;

use crate::AppState;

/// Resolves the authenticated principal from the identity-provider subject
/// the upstream proxy forwards in `X-SI-User`. Unknown subjects resolve to
/// None; membership and role data come from storage, never from headers.
pub(crate) async fn resolve_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Principal>> {
    let Some(subject) = headers.get("x-si-user").and_then(|h| h.to_str().ok()) else {
        return Ok(None);
    };
    let Some(user) = state.kernel().find_user_by_external_async(subject).await? else {
        return Ok(None);
    };
    let memberships = state.kernel().memberships_for_user_async(&user.id).await?;
    Ok(Some(Principal {
        user_id: Uuid::parse_str(&user.id)?,
        memberships: memberships
            .into_iter()
            .map(|m| Membership {
                org_id: m.org_id,
                org_kind: m.org_kind,
                is_admin: m.is_admin,
                is_reviewer: m.is_reviewer,
            })
            .collect(),
    }))
}

pub(crate) fn admin_ok(headers: &HeaderMap) -> bool {
    // Debug mode opens admin surfaces for local development convenience.
    if crate::config::env_truthy("SI_DEBUG") {
        return true;
    }

    // When SI_ADMIN_TOKEN or SI_ADMIN_TOKEN_SHA256 is set, require it in
    // Authorization: Bearer or X-SI-Admin
    let token_plain = std::env::var("SI_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    let token_hash = std::env::var("SI_ADMIN_TOKEN_SHA256")
        .ok()
        .filter(|t| !t.is_empty());
    if token_plain.is_none() && token_hash.is_none() {
        return false;
    }
    let mut presented: Option<String> = None;
    if let Some(hv) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(bearer) = hv.strip_prefix("Bearer ") {
            presented = Some(bearer.to_string());
        }
    }
    if presented.is_none() {
        if let Some(hv) = headers.get("X-SI-Admin").and_then(|h| h.to_str().ok()) {
            presented = Some(hv.to_string());
        }
    }
    let Some(ptok) = presented else { return false };
    if let Some(ref hpref) = token_hash {
        let want = hpref.trim().to_ascii_lowercase();
        let got_hex = {
            let mut hasher = sha2::Sha256::new();
            hasher.update(ptok.as_bytes());
            hex::encode(hasher.finalize())
        };
        return ct_eq(want.as_bytes(), got_hex.as_bytes())
            || token_plain
                .as_ref()
                .map(|p| ct_eq(p.as_bytes(), ptok.as_bytes()))
                .unwrap_or(false);
    }
    if let Some(ref p) = token_plain {
        return ct_eq(p.as_bytes(), ptok.as_bytes());
    }
    false
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
