use std::path::PathBuf;
use std::sync::Arc;

use si_events::{Bus, Envelope};
use si_kernel::Kernel;
use si_policy::PolicyEngine;
use tracing::warn;

#[derive(Clone)]
pub(crate) struct AppState {
    bus: Bus,
    kernel: Kernel,
    policy: Arc<PolicyEngine>,
    state_dir: Arc<PathBuf>,
    endpoints: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        bus: Bus,
        kernel: Kernel,
        policy: Arc<PolicyEngine>,
        state_dir: PathBuf,
        endpoints: Arc<Vec<String>>,
    ) -> Self {
        Self {
            bus,
            kernel,
            policy,
            state_dir: Arc::new(state_dir),
            endpoints,
        }
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn policy(&self) -> &PolicyEngine {
        self.policy.as_ref()
    }

    pub fn state_dir(&self) -> &std::path::Path {
        self.state_dir.as_path()
    }

    pub fn endpoints(&self) -> Arc<Vec<String>> {
        self.endpoints.clone()
    }

    /// Journals an envelope and fans it out to live subscribers. The journal
    /// write is best-effort; a failure only costs replay, not delivery.
    pub async fn publish(&self, kind: &str, payload: &serde_json::Value) {
        let env = Envelope {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload: payload.clone(),
        };
        if let Err(err) = self.kernel.append_event_async(&env).await {
            warn!(target: "events", "event journal append failed: {err:?}");
        }
        self.bus.publish_envelope(env);
    }
}
