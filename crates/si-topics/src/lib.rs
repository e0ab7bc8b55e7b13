//! Canonical event topic constants shared across services.
//!
//! This crate centralizes the string constants used when publishing events
//! so that the server, the simulation driver, and any future consumers stay
//! in sync. Keep this list alphabetized within sections and favor dot.case
//! names.

// Studies
pub const TOPIC_STUDY_APPROVED: &str = "study.approved";
pub const TOPIC_STUDY_CREATED: &str = "study.created";
pub const TOPIC_STUDY_DELETED: &str = "study.deleted";
pub const TOPIC_STUDY_REJECTED: &str = "study.rejected";
pub const TOPIC_STUDY_SUBMITTED: &str = "study.submitted";
pub const TOPIC_STUDY_UPDATED: &str = "study.updated";

// Study jobs
pub const TOPIC_JOB_CREATED: &str = "studyjob.created";
pub const TOPIC_JOB_FILE_ADDED: &str = "studyjob.file.added";
pub const TOPIC_JOB_RESULTS_APPROVED: &str = "studyjob.results.approved";
pub const TOPIC_JOB_RESULTS_REJECTED: &str = "studyjob.results.rejected";
pub const TOPIC_JOB_STATUS_CHANGED: &str = "studyjob.status.changed";

// Legacy runs
pub const TOPIC_RUN_CREATED: &str = "studyrun.created";
pub const TOPIC_RUN_STATUS_CHANGED: &str = "studyrun.status.changed";

// Tenancy / admin plane
pub const TOPIC_MEMBER_UPSERTED: &str = "org.member.upserted";
pub const TOPIC_ORG_CREATED: &str = "org.created";
pub const TOPIC_USER_CREATED: &str = "user.created";

// Policy
pub const TOPIC_POLICY_DECISION: &str = "policy.decision";

// Service lifecycle
pub const TOPIC_SERVICE_HEALTH: &str = "service.health";
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";
