//! Lifecycle rules for studies and study jobs.
//!
//! Everything here is a pure function over explicit inputs: the transition
//! tables, the ordered fold that derives a job's current state from its
//! append-only status log, and the artifact visibility rule. Persistence
//! and HTTP concerns live elsewhere.

use serde::{Deserialize, Serialize};
use si_policy::Action;
use si_protocol::{FileType, JobStatus, StudyStatus};

/// Legal successors of a job status. Empty slice means terminal.
pub fn successors(status: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match status {
        Initiated => &[CodeSubmitted],
        CodeSubmitted => &[CodeScanned, CodeApproved, CodeRejected],
        CodeScanned => &[CodeApproved, CodeRejected],
        CodeApproved => &[JobPackaging],
        JobPackaging => &[JobReady, JobErrored],
        JobReady => &[JobProvisioning],
        JobProvisioning => &[JobRunning, JobErrored],
        JobRunning => &[RunComplete, JobErrored],
        RunComplete => &[FilesApproved, FilesRejected],
        CodeRejected | JobErrored | FilesApproved | FilesRejected => &[],
    }
}

pub fn is_terminal(status: JobStatus) -> bool {
    successors(status).is_empty()
}

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    successors(from).contains(&to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job is already in terminal status {current:?}")]
    Terminal { current: JobStatus },
    #[error("illegal transition {from:?} -> {to:?}")]
    Illegal { from: JobStatus, to: JobStatus },
}

/// Validates one append against the derived current status.
pub fn check_transition(current: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    if is_terminal(current) {
        return Err(TransitionError::Terminal { current });
    }
    if !can_transition(current, to) {
        return Err(TransitionError::Illegal { from: current, to });
    }
    Ok(())
}

/// Study proposals move `DRAFT -> PENDING-REVIEW -> APPROVED | REJECTED`;
/// decisions are final.
pub fn study_can_transition(from: StudyStatus, to: StudyStatus) -> bool {
    use StudyStatus::*;
    matches!(
        (from, to),
        (Draft, PendingReview) | (PendingReview, Approved) | (PendingReview, Rejected)
    )
}

/// The policy action a transition target demands of its caller.
///
/// Code submission comes from the lab; decisions come from enclave
/// reviewers; everything in between is written by the enclave's own
/// infrastructure.
pub fn required_action(to: JobStatus) -> Action {
    use JobStatus::*;
    match to {
        Initiated => Action::Create,
        CodeSubmitted => Action::Submit,
        CodeScanned | JobPackaging | JobReady | JobProvisioning | JobRunning | JobErrored
        | RunComplete => Action::Operate,
        CodeApproved | CodeRejected | FilesApproved | FilesRejected => Action::Review,
    }
}

// -------- Status log fold --------

/// One row of the append-only status log, as the reducer sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub seq: i64,
    pub status: JobStatus,
    /// RFC3339 UTC timestamp; lexicographic order is chronological order.
    pub created: String,
}

/// Flags derived from a job's full status history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub current: Option<JobStatus>,
    pub is_complete: bool,
    pub is_errored: bool,
    pub is_code_approved: bool,
    pub is_code_rejected: bool,
    pub is_files_approved: bool,
    pub is_files_rejected: bool,
}

impl JobSnapshot {
    pub fn is_rejected(&self) -> bool {
        self.is_code_rejected || self.is_files_rejected
    }

    pub fn is_terminal(&self) -> bool {
        self.current.map(is_terminal).unwrap_or(false)
    }
}

/// Folds a status history into a [`JobSnapshot`].
///
/// The fold order is `(created, seq)` ascending regardless of how the
/// caller happened to collect the rows, so the result is invariant under
/// permutation of the input.
pub fn fold_status_changes(events: &[StatusEvent]) -> JobSnapshot {
    let mut ordered: Vec<&StatusEvent> = events.iter().collect();
    ordered.sort_by(|a, b| (a.created.as_str(), a.seq).cmp(&(b.created.as_str(), b.seq)));

    let mut snap = JobSnapshot::default();
    for ev in ordered {
        snap.current = Some(ev.status);
        match ev.status {
            JobStatus::RunComplete => snap.is_complete = true,
            JobStatus::JobErrored => snap.is_errored = true,
            JobStatus::CodeApproved => snap.is_code_approved = true,
            JobStatus::CodeRejected => snap.is_code_rejected = true,
            JobStatus::FilesApproved => snap.is_files_approved = true,
            JobStatus::FilesRejected => snap.is_files_rejected = true,
            _ => {}
        }
    }
    snap
}

// -------- Artifact visibility --------

/// Whether the submitting lab may see a job artifact. The reviewing org is
/// never filtered; encrypted artifacts stay hidden from the lab until the
/// job carries a FILES-APPROVED transition.
pub fn visible_to_submitter(file_type: FileType, snapshot: &JobSnapshot) -> bool {
    if file_type.is_encrypted() {
        snapshot.is_files_approved
    } else {
        true
    }
}
