use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub trace_id: Option<String>,
    pub code: Option<String>,
}

/// Opaque cursor pagination envelope.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

// -------- Tenancy --------

/// Tenant organization flavor: enclaves hold data and review, labs submit.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrgKind {
    Enclave,
    Lab,
}

impl OrgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrgKind::Enclave => "enclave",
            OrgKind::Lab => "lab",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enclave" => Some(OrgKind::Enclave),
            "lab" => Some(OrgKind::Lab),
            _ => None,
        }
    }
}

// -------- Lifecycle status enums --------
//
// The wire and storage form of every status is the SCREAMING-KEBAB string
// (`"PENDING-REVIEW"`, `"CODE-SUBMITTED"`); `as_str`/`parse` are the single
// source of truth for that mapping.

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum StudyStatus {
    Draft,
    PendingReview,
    Approved,
    Rejected,
}

impl StudyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudyStatus::Draft => "DRAFT",
            StudyStatus::PendingReview => "PENDING-REVIEW",
            StudyStatus::Approved => "APPROVED",
            StudyStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DRAFT" => Some(StudyStatus::Draft),
            "PENDING-REVIEW" => Some(StudyStatus::PendingReview),
            "APPROVED" => Some(StudyStatus::Approved),
            "REJECTED" => Some(StudyStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum JobStatus {
    Initiated,
    CodeSubmitted,
    CodeScanned,
    CodeApproved,
    CodeRejected,
    JobPackaging,
    JobReady,
    JobProvisioning,
    JobRunning,
    JobErrored,
    RunComplete,
    FilesApproved,
    FilesRejected,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Initiated => "INITIATED",
            JobStatus::CodeSubmitted => "CODE-SUBMITTED",
            JobStatus::CodeScanned => "CODE-SCANNED",
            JobStatus::CodeApproved => "CODE-APPROVED",
            JobStatus::CodeRejected => "CODE-REJECTED",
            JobStatus::JobPackaging => "JOB-PACKAGING",
            JobStatus::JobReady => "JOB-READY",
            JobStatus::JobProvisioning => "JOB-PROVISIONING",
            JobStatus::JobRunning => "JOB-RUNNING",
            JobStatus::JobErrored => "JOB-ERRORED",
            JobStatus::RunComplete => "RUN-COMPLETE",
            JobStatus::FilesApproved => "FILES-APPROVED",
            JobStatus::FilesRejected => "FILES-REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INITIATED" => Some(JobStatus::Initiated),
            "CODE-SUBMITTED" => Some(JobStatus::CodeSubmitted),
            "CODE-SCANNED" => Some(JobStatus::CodeScanned),
            "CODE-APPROVED" => Some(JobStatus::CodeApproved),
            "CODE-REJECTED" => Some(JobStatus::CodeRejected),
            "JOB-PACKAGING" => Some(JobStatus::JobPackaging),
            "JOB-READY" => Some(JobStatus::JobReady),
            "JOB-PROVISIONING" => Some(JobStatus::JobProvisioning),
            "JOB-RUNNING" => Some(JobStatus::JobRunning),
            "JOB-ERRORED" => Some(JobStatus::JobErrored),
            "RUN-COMPLETE" => Some(JobStatus::RunComplete),
            "FILES-APPROVED" => Some(JobStatus::FilesApproved),
            "FILES-REJECTED" => Some(JobStatus::FilesRejected),
            _ => None,
        }
    }
}

/// Legacy run lifecycle: a plain status column, updated in place.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum RunStatus {
    Initiated,
    Running,
    Errored,
    Complete,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initiated => "INITIATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Errored => "ERRORED",
            RunStatus::Complete => "COMPLETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INITIATED" => Some(RunStatus::Initiated),
            "RUNNING" => Some(RunStatus::Running),
            "ERRORED" => Some(RunStatus::Errored),
            "COMPLETE" => Some(RunStatus::Complete),
            _ => None,
        }
    }
}

// -------- Job artifacts --------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum FileType {
    MainCode,
    SupplementalCode,
    EncryptedResult,
    ApprovedResult,
    EncryptedCodeRunLog,
    ApprovedCodeRunLog,
    EncryptedSecurityScanLog,
    ApprovedSecurityScanLog,
    EncryptedPackagingErrorLog,
    ApprovedPackagingErrorLog,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::MainCode => "MAIN-CODE",
            FileType::SupplementalCode => "SUPPLEMENTAL-CODE",
            FileType::EncryptedResult => "ENCRYPTED-RESULT",
            FileType::ApprovedResult => "APPROVED-RESULT",
            FileType::EncryptedCodeRunLog => "ENCRYPTED-CODE-RUN-LOG",
            FileType::ApprovedCodeRunLog => "APPROVED-CODE-RUN-LOG",
            FileType::EncryptedSecurityScanLog => "ENCRYPTED-SECURITY-SCAN-LOG",
            FileType::ApprovedSecurityScanLog => "APPROVED-SECURITY-SCAN-LOG",
            FileType::EncryptedPackagingErrorLog => "ENCRYPTED-PACKAGING-ERROR-LOG",
            FileType::ApprovedPackagingErrorLog => "APPROVED-PACKAGING-ERROR-LOG",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "MAIN-CODE" => Some(FileType::MainCode),
            "SUPPLEMENTAL-CODE" => Some(FileType::SupplementalCode),
            "ENCRYPTED-RESULT" => Some(FileType::EncryptedResult),
            "APPROVED-RESULT" => Some(FileType::ApprovedResult),
            "ENCRYPTED-CODE-RUN-LOG" => Some(FileType::EncryptedCodeRunLog),
            "APPROVED-CODE-RUN-LOG" => Some(FileType::ApprovedCodeRunLog),
            "ENCRYPTED-SECURITY-SCAN-LOG" => Some(FileType::EncryptedSecurityScanLog),
            "APPROVED-SECURITY-SCAN-LOG" => Some(FileType::ApprovedSecurityScanLog),
            "ENCRYPTED-PACKAGING-ERROR-LOG" => Some(FileType::EncryptedPackagingErrorLog),
            "APPROVED-PACKAGING-ERROR-LOG" => Some(FileType::ApprovedPackagingErrorLog),
            _ => None,
        }
    }

    pub fn is_code(self) -> bool {
        matches!(self, FileType::MainCode | FileType::SupplementalCode)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            FileType::EncryptedResult
                | FileType::EncryptedCodeRunLog
                | FileType::EncryptedSecurityScanLog
                | FileType::EncryptedPackagingErrorLog
        )
    }

    /// The `APPROVED-*` type an approval transition mints from an
    /// `ENCRYPTED-*` artifact, if any.
    pub fn approved_counterpart(self) -> Option<FileType> {
        match self {
            FileType::EncryptedResult => Some(FileType::ApprovedResult),
            FileType::EncryptedCodeRunLog => Some(FileType::ApprovedCodeRunLog),
            FileType::EncryptedSecurityScanLog => Some(FileType::ApprovedSecurityScanLog),
            FileType::EncryptedPackagingErrorLog => Some(FileType::ApprovedPackagingErrorLog),
            _ => None,
        }
    }
}

// -------- URL-safe id codec --------
//
// Record ids travel in URLs both as canonical UUIDs and as the compact
// 22-character unpadded base64url form the web client historically used.

#[derive(Debug, thiserror::Error)]
pub enum IdCodecError {
    #[error("invalid base64url id: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid uuid bytes: {0}")]
    Uuid(#[from] uuid::Error),
}

pub fn uuid_to_b64(id: &Uuid) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

pub fn b64_to_uuid(raw: &str) -> Result<Uuid, IdCodecError> {
    let bytes = URL_SAFE_NO_PAD.decode(raw)?;
    Ok(Uuid::from_slice(&bytes)?)
}

/// Accepts either encoding; canonical UUID form wins when both parse.
pub fn parse_id(raw: &str) -> Result<Uuid, IdCodecError> {
    match Uuid::parse_str(raw) {
        Ok(id) => Ok(id),
        Err(_) => b64_to_uuid(raw),
    }
}
