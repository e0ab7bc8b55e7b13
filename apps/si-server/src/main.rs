use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

mod api;
mod app_state;
mod auth;
mod config;
mod responses;
mod router;
mod sim;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    si_otel::init();

    let http_cfg = match config::http_config_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let state_dir = config::state_dir();
    let kernel = match si_kernel::Kernel::open(&state_dir) {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("error: failed to open storage in {}: {err:?}", state_dir.display());
            std::process::exit(2);
        }
    };
    let bus = si_events::Bus::new(256);
    let policy = Arc::new(si_policy::PolicyEngine::load_from_env());
    let (router, endpoints) = router::build_router();
    let state = AppState::new(bus, kernel, policy, state_dir, Arc::new(endpoints));
    state
        .publish(
            si_topics::TOPIC_SERVICE_START,
            &serde_json::json!({"version": env!("CARGO_PKG_VERSION")}),
        )
        .await;

    let app = router
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(
            http_cfg.concurrency_limit,
        ));

    let listener = tokio::net::TcpListener::bind(http_cfg.addr)
        .await
        .expect("bind server socket");
    info!("listening on {}", http_cfg.addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }
    state
        .publish(si_topics::TOPIC_SERVICE_STOP, &serde_json::json!({}))
        .await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::router::{self, paths};
    use crate::test_support::env;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD as BASE64_STD;
    use base64::Engine as _;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use si_kernel::{OrgRow, StudyRow, UserRow};
    use si_policy::{PolicyConfig, PolicyEngine};
    use si_protocol::OrgKind;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    const RESEARCHER: &str = "idp|researcher";
    const REVIEWER: &str = "idp|reviewer";
    const OUTSIDER: &str = "idp|outsider";

    struct Seed {
        #[allow(dead_code)]
        enclave: OrgRow,
        #[allow(dead_code)]
        lab: OrgRow,
        study: StudyRow,
        #[allow(dead_code)]
        researcher: UserRow,
        #[allow(dead_code)]
        reviewer: UserRow,
    }

    fn build_app(dir: &Path) -> (axum::Router, AppState) {
        let bus = si_events::Bus::new(64);
        let kernel = si_kernel::Kernel::open(dir).expect("open kernel for tests");
        let policy = Arc::new(PolicyEngine::with_config(PolicyConfig::default()));
        let (router, endpoints) = router::build_router();
        let state = AppState::new(bus, kernel, policy, dir.to_path_buf(), Arc::new(endpoints));
        (router.with_state(state.clone()), state)
    }

    fn seed(state: &AppState) -> Seed {
        let kernel = state.kernel();
        let enclave = kernel
            .insert_org("enclave-one", "Enclave One", OrgKind::Enclave)
            .expect("enclave");
        let lab = kernel
            .insert_org("lab-one", "Lab One", OrgKind::Lab)
            .expect("lab");
        let other_lab = kernel
            .insert_org("lab-two", "Lab Two", OrgKind::Lab)
            .expect("other lab");

        let researcher = kernel
            .insert_user(RESEARCHER, "Researcher", Some("res@lab.example"))
            .expect("researcher");
        kernel
            .upsert_org_user(&lab.id, &researcher.id, false, false)
            .expect("lab membership");
        let reviewer = kernel
            .insert_user(REVIEWER, "Reviewer", None)
            .expect("reviewer");
        kernel
            .upsert_org_user(&enclave.id, &reviewer.id, false, true)
            .expect("enclave membership");
        let outsider = kernel
            .insert_user(OUTSIDER, "Outsider", None)
            .expect("outsider");
        kernel
            .upsert_org_user(&other_lab.id, &outsider.id, true, true)
            .expect("outsider membership");

        let study = kernel
            .insert_study(
                "Hypertension cohort",
                &researcher.id,
                &enclave.id,
                &lab.id,
                Some("r"),
                None,
                None,
                None,
            )
            .expect("study");
        Seed {
            enclave,
            lab,
            study,
            researcher,
            reviewer,
        }
    }

    async fn send(
        app: &axum::Router,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("X-SI-User", user);
        }
        let request = if let Some(body) = body {
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request")
        } else {
            builder.body(Body::empty()).expect("request")
        };
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collect")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn set_status(
        app: &axum::Router,
        job_id: &str,
        user: &str,
        status: &str,
    ) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            &format!("/jobs/{job_id}/status"),
            Some(user),
            Some(json!({"status": status})),
        )
        .await
    }

    #[tokio::test]
    async fn study_approval_sets_exactly_one_timestamp() {
        let temp = tempdir().expect("tempdir");
        let (app, state) = build_app(temp.path());
        let seed = seed(&state);
        let study_uri = format!("/studies/{}", seed.study.id);

        let (status, _) = send(
            &app,
            "POST",
            &format!("{study_uri}/submit"),
            Some(RESEARCHER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            &format!("{study_uri}/approve"),
            Some(REVIEWER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "APPROVED");
        assert!(body["approved_at"].is_string());
        assert!(body["rejected_at"].is_null());

        // The mirror decision arrives second and loses.
        let (status, _) = send(
            &app,
            "POST",
            &format!("{study_uri}/reject"),
            Some(REVIEWER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "GET", &study_uri, Some(RESEARCHER), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "APPROVED");
        assert!(body["rejected_at"].is_null());
    }

    #[tokio::test]
    async fn tenancy_is_enforced_on_every_surface() {
        let temp = tempdir().expect("tempdir");
        let (app, state) = build_app(temp.path());
        let seed = seed(&state);
        let study_uri = format!("/studies/{}", seed.study.id);

        // No principal header at all.
        let (status, _) = send(&app, "GET", &study_uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // A member of an unrelated org is denied uniformly.
        let (status, body) = send(&app, "GET", &study_uri, Some(OUTSIDER), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["title"], "Forbidden");
        assert!(body["explain"].is_object());

        let (status, _) = send(
            &app,
            "POST",
            &format!("{study_uri}/submit"),
            Some(OUTSIDER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The researcher cannot make enclave decisions.
        send(&app, "POST", &format!("{study_uri}/submit"), Some(RESEARCHER), None).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("{study_uri}/approve"),
            Some(RESEARCHER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn job_transitions_respect_roles_and_the_table() {
        let temp = tempdir().expect("tempdir");
        let (app, state) = build_app(temp.path());
        let seed = seed(&state);

        let (status, job) = send(
            &app,
            "POST",
            &format!("/studies/{}/jobs", seed.study.id),
            Some(RESEARCHER),
            Some(json!({"language": "r"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let job_id = job["id"].as_str().expect("job id").to_string();

        // A principal from an unrelated org cannot write status at all.
        let (status, _) = set_status(&app, &job_id, OUTSIDER, "CODE-SUBMITTED").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Lab submits code; only the reviewer may judge it.
        let (status, _) = set_status(&app, &job_id, RESEARCHER, "CODE-SUBMITTED").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = set_status(&app, &job_id, RESEARCHER, "CODE-APPROVED").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = set_status(&app, &job_id, REVIEWER, "CODE-APPROVED").await;
        assert_eq!(status, StatusCode::OK);

        // Skipping packaging is rejected without a write.
        let (status, body) = set_status(&app, &job_id, REVIEWER, "JOB-RUNNING").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["detail"]
            .as_str()
            .unwrap_or_default()
            .contains("illegal transition"));

        let (status, _) = set_status(&app, &job_id, REVIEWER, "JOB-PACKAGING").await;
        assert_eq!(status, StatusCode::OK);

        let (status, history) = send(
            &app,
            "GET",
            &format!("/jobs/{job_id}/statuses"),
            Some(RESEARCHER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let statuses: Vec<&str> = history["items"]
            .as_array()
            .expect("items")
            .iter()
            .map(|i| i["status"].as_str().expect("status"))
            .collect();
        assert_eq!(
            statuses,
            vec!["INITIATED", "CODE-SUBMITTED", "CODE-APPROVED", "JOB-PACKAGING"]
        );
    }

    #[tokio::test]
    async fn encrypted_results_stay_hidden_until_approval() {
        let temp = tempdir().expect("tempdir");
        let (app, state) = build_app(temp.path());
        let seed = seed(&state);

        let (_, job) = send(
            &app,
            "POST",
            &format!("/studies/{}/jobs", seed.study.id),
            Some(RESEARCHER),
            Some(json!({})),
        )
        .await;
        let job_id = job["id"].as_str().expect("job id").to_string();

        set_status(&app, &job_id, RESEARCHER, "CODE-SUBMITTED").await;
        let (status, _) = set_status(&app, &job_id, REVIEWER, "CODE-REJECTED").await;
        assert_eq!(status, StatusCode::OK);

        // Enclave-side artifact lands even though the job is dead.
        let (status, file) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/files"),
            Some(REVIEWER),
            Some(json!({
                "file_type": "ENCRYPTED-RESULT",
                "name": "results.enc",
                "content_b64": BASE64_STD.encode(b"ciphertext"),
                "content_type": "application/octet-stream",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let file_id = file["id"].as_str().expect("file id").to_string();

        // The lab sees nothing and cannot download; existence is hidden.
        let (status, listing) = send(
            &app,
            "GET",
            &format!("/jobs/{job_id}/files"),
            Some(RESEARCHER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(listing["items"].as_array().expect("items").is_empty());
        let (status, _) = send(&app, "GET", &format!("/dl/{file_id}"), Some(RESEARCHER), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // The reviewing side still sees and fetches it.
        let (status, listing) = send(
            &app,
            "GET",
            &format!("/jobs/{job_id}/files"),
            Some(REVIEWER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["items"].as_array().expect("items").len(), 1);
        let (status, _) = send(&app, "GET", &format!("/dl/{file_id}"), Some(REVIEWER), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn approval_mints_counterparts_and_releases_results() {
        let temp = tempdir().expect("tempdir");
        let (app, state) = build_app(temp.path());
        let seed = seed(&state);

        let (_, job) = send(
            &app,
            "POST",
            &format!("/studies/{}/jobs", seed.study.id),
            Some(RESEARCHER),
            Some(json!({})),
        )
        .await;
        let job_id = job["id"].as_str().expect("job id").to_string();

        set_status(&app, &job_id, RESEARCHER, "CODE-SUBMITTED").await;
        for step in [
            "CODE-APPROVED",
            "JOB-PACKAGING",
            "JOB-READY",
            "JOB-PROVISIONING",
            "JOB-RUNNING",
            "RUN-COMPLETE",
        ] {
            let (status, _) = set_status(&app, &job_id, REVIEWER, step).await;
            assert_eq!(status, StatusCode::OK, "step {step}");
        }
        let (status, _) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/files"),
            Some(REVIEWER),
            Some(json!({
                "file_type": "ENCRYPTED-RESULT",
                "name": "results.enc",
                "content_b64": BASE64_STD.encode(b"ciphertext"),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        // Premature approval attempts by the lab are forbidden.
        let (status, _) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/results/approve"),
            Some(RESEARCHER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/results/approve"),
            Some(REVIEWER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "FILES-APPROVED");
        assert_eq!(body["approved_files"], 1);

        // Now the lab sees both the encrypted original and the release.
        let (_, listing) = send(
            &app,
            "GET",
            &format!("/jobs/{job_id}/files"),
            Some(RESEARCHER),
            None,
        )
        .await;
        let types: Vec<&str> = listing["items"]
            .as_array()
            .expect("items")
            .iter()
            .map(|i| i["file_type"].as_str().expect("type"))
            .collect();
        assert!(types.contains(&"ENCRYPTED-RESULT"));
        assert!(types.contains(&"APPROVED-RESULT"));

        // A second decision hits the terminal guard.
        let (status, _) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/results/reject"),
            Some(REVIEWER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn admin_surfaces_require_the_token() {
        let temp = tempdir().expect("tempdir");
        let (app, _state) = build_app(temp.path());
        let mut env_guard = env::guard();
        env_guard.remove("SI_DEBUG");
        env_guard.set("SI_ADMIN_TOKEN", "secret-token");

        let (status, _) = send(
            &app,
            "POST",
            paths::ADMIN_ORGS,
            None,
            Some(json!({"slug": "x", "name": "X", "kind": "enclave"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri(paths::ADMIN_ORGS)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::from(
                json!({"slug": "new-enclave", "name": "New Enclave", "kind": "enclave"})
                    .to_string(),
            ))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        let (status, body) = send(&app, "GET", paths::HEALTHZ, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }
}
