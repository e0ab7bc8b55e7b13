use std::mem;

use axum::{
    handler::Handler,
    routing::{delete, get, patch, post},
    Router,
};

use crate::{api, AppState};

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    fn record(&mut self, method: &str, path: &'static str) {
        self.endpoints.push(format!("{} {}", method, path));
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("GET", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("POST", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn route_patch<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("PATCH", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, patch(handler));
        self
    }

    pub fn route_delete<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("DELETE", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, delete(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const EVENTS: &str = "/events";

    pub const ADMIN_ORGS: &str = "/admin/orgs";
    pub const ADMIN_USERS: &str = "/admin/users";
    pub const ADMIN_ORG_MEMBERS: &str = "/admin/orgs/{id}/members";
    pub const ADMIN_AUDIT: &str = "/admin/audit";

    pub const STUDIES: &str = "/studies";
    pub const STUDY_ID: &str = "/studies/{id}";
    pub const STUDY_SUBMIT: &str = "/studies/{id}/submit";
    pub const STUDY_APPROVE: &str = "/studies/{id}/approve";
    pub const STUDY_REJECT: &str = "/studies/{id}/reject";
    pub const STUDY_JOBS: &str = "/studies/{id}/jobs";
    pub const STUDY_RUNS: &str = "/studies/{id}/runs";

    pub const JOB_ID: &str = "/jobs/{id}";
    pub const JOB_STATUSES: &str = "/jobs/{id}/statuses";
    pub const JOB_STATUS: &str = "/jobs/{id}/status";
    pub const JOB_FILES: &str = "/jobs/{id}/files";
    pub const JOB_RESULTS_APPROVE: &str = "/jobs/{id}/results/approve";
    pub const JOB_RESULTS_REJECT: &str = "/jobs/{id}/results/reject";

    pub const RUN_ID: &str = "/runs/{id}";
    pub const RUN_STATUS: &str = "/runs/{id}/status";

    pub const DOWNLOAD: &str = "/dl/{id}";
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut b = RouterBuilder::new();
    b.route_get(paths::HEALTHZ, api::meta::healthz);
    b.route_get(paths::ABOUT, api::meta::about);
    b.route_get(paths::EVENTS, api::events::events_sse);

    b.route_post(paths::ADMIN_ORGS, api::admin::org_create);
    b.route_post(paths::ADMIN_USERS, api::admin::user_create);
    b.route_post(paths::ADMIN_ORG_MEMBERS, api::admin::member_upsert);
    b.route_get(paths::ADMIN_AUDIT, api::admin::audit_list);

    b.route_post(paths::STUDIES, api::studies::study_create);
    b.route_get(paths::STUDIES, api::studies::studies_list);
    b.route_get(paths::STUDY_ID, api::studies::study_get);
    b.route_patch(paths::STUDY_ID, api::studies::study_update);
    b.route_delete(paths::STUDY_ID, api::studies::study_delete);
    b.route_post(paths::STUDY_SUBMIT, api::studies::study_submit);
    b.route_post(paths::STUDY_APPROVE, api::studies::study_approve);
    b.route_post(paths::STUDY_REJECT, api::studies::study_reject);

    b.route_post(paths::STUDY_JOBS, api::jobs::job_create);
    b.route_get(paths::JOB_ID, api::jobs::job_get);
    b.route_get(paths::JOB_STATUSES, api::jobs::job_statuses);
    b.route_post(paths::JOB_STATUS, api::jobs::job_status_set);

    b.route_post(paths::JOB_FILES, api::files::file_upload);
    b.route_get(paths::JOB_FILES, api::files::files_list);
    b.route_post(paths::JOB_RESULTS_APPROVE, api::files::results_approve);
    b.route_post(paths::JOB_RESULTS_REJECT, api::files::results_reject);
    b.route_get(paths::DOWNLOAD, api::files::file_download);

    b.route_post(paths::STUDY_RUNS, api::runs::run_create);
    b.route_get(paths::RUN_ID, api::runs::run_get);
    b.route_post(paths::RUN_STATUS, api::runs::run_status_set);

    b.build()
}
