use serde_json::json;
use si_kernel::{Kernel, TransitionOutcome};
use si_protocol::{FileType, JobStatus};
use si_topics as topics;
use tracing::warn;

use crate::{config, AppState};

pub(crate) fn simulate_enabled() -> bool {
    config::env_truthy("SI_SIMULATE_RESULTS")
}

/// Dev-only driver: once a job reports JOB-RUNNING, pretend the enclave
/// finished the run and dropped encrypted results shortly after.
pub(crate) fn spawn_results_simulation(state: AppState, job_id: String) {
    tokio::spawn(async move {
        let delay_ms: u64 = std::env::var("SI_SIMULATE_RESULTS_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(250);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

        let payload = b"simulated encrypted results";
        let sha = match Kernel::cas_put(payload, Some("application/octet-stream"), state.state_dir())
            .await
        {
            Ok(sha) => sha,
            Err(err) => {
                warn!(target: "sim", "simulated results blob write failed: {err:?}");
                return;
            }
        };
        match state
            .kernel()
            .append_job_status_async(&job_id, JobStatus::RunComplete, Some("simulated"), None)
            .await
        {
            Ok(TransitionOutcome::Applied(row)) => {
                if let Err(err) = state
                    .kernel()
                    .insert_job_file_async(
                        &job_id,
                        FileType::EncryptedResult.as_str(),
                        "results.enc",
                        &sha,
                        Some("application/octet-stream"),
                    )
                    .await
                {
                    warn!(target: "sim", "simulated results row insert failed: {err:?}");
                }
                state
                    .publish(
                        topics::TOPIC_JOB_STATUS_CHANGED,
                        &json!({"job_id": job_id, "status": row.status, "simulated": true}),
                    )
                    .await;
            }
            Ok(TransitionOutcome::Rejected(reason)) => {
                warn!(target: "sim", "simulated completion skipped for {job_id}: {reason}");
            }
            Err(err) => warn!(target: "sim", "simulated completion failed: {err:?}"),
        }
    });
}
