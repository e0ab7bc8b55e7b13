use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::{json, Value};
use si_protocol::ProblemDetails;

fn problem(status: StatusCode, title: &str, detail: Option<String>) -> Response {
    let body = ProblemDetails {
        r#type: "about:blank".to_string(),
        title: title.to_string(),
        status: status.as_u16(),
        detail,
        instance: None,
        trace_id: None,
        code: None,
    };
    (status, Json(body)).into_response()
}

pub fn bad_request(detail: &str) -> Response {
    problem(StatusCode::BAD_REQUEST, "Bad Request", Some(detail.into()))
}

pub fn unauthorized() -> Response {
    problem(
        StatusCode::UNAUTHORIZED,
        "Unauthorized",
        Some("missing or unknown principal".into()),
    )
}

pub fn forbidden(explain: Value) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "type": "about:blank",
            "title": "Forbidden",
            "status": 403,
            "detail": "Denied by policy",
            "explain": explain,
        })),
    )
        .into_response()
}

pub fn not_found() -> Response {
    problem(StatusCode::NOT_FOUND, "Not Found", None)
}

pub fn conflict(detail: &str) -> Response {
    problem(StatusCode::CONFLICT, "Conflict", Some(detail.into()))
}

pub fn internal(err: &anyhow::Error) -> Response {
    tracing::error!(target: "http", "internal error: {err:?}");
    problem(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Error",
        Some(err.to_string()),
    )
}
