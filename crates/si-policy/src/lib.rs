use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use si_protocol::OrgKind;
use uuid::Uuid;

/// One org membership row, carried explicitly on the principal. There is
/// no ambient session object anywhere in the workspace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Membership {
    pub org_id: Uuid,
    pub org_kind: OrgKind,
    pub is_admin: bool,
    pub is_reviewer: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub memberships: Vec<Membership>,
}

impl Principal {
    pub fn membership(&self, org_id: Uuid) -> Option<&Membership> {
        self.memberships.iter().find(|m| m.org_id == org_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read a record or artifact listing.
    View,
    /// Create a study, job, or run under the submitting lab.
    Create,
    /// Edit a draft study or add job artifacts.
    Update,
    /// Submit code / a proposal for review.
    Submit,
    /// Infrastructure-side job progression (scan, package, provision, run).
    Operate,
    /// Approve or reject code, results, or a study proposal.
    Review,
    /// Destroy a study and purge its artifacts.
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Submit => "submit",
            Action::Operate => "operate",
            Action::Review => "review",
            Action::Delete => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Study,
    StudyJob,
    JobFile,
    StudyRun,
}

/// The org scoping of the record an action targets. `org_id` is the
/// reviewing enclave, `submitted_by_org_id` the originating lab.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub org_id: Uuid,
    pub submitted_by_org_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    #[serde(default)]
    pub explain: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allow_all: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { allow_all: false }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyEngine {
    cfg: PolicyConfig,
}

impl PolicyEngine {
    pub fn load_from_env() -> Self {
        if std::env::var("SI_POLICY_ALLOW_ALL")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
        {
            return Self::with_config(PolicyConfig { allow_all: true });
        }
        if let Ok(posture) = std::env::var("SI_SECURITY_POSTURE") {
            return Self::with_config(posture_to_config(&posture));
        }
        Self::with_config(posture_to_config("standard"))
    }

    pub fn with_config(cfg: PolicyConfig) -> Self {
        Self { cfg }
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(&self.cfg).unwrap_or(json!({}))
    }

    /// The permission predicate: pure over the principal's explicit
    /// membership data and the resource's org scoping.
    pub fn evaluate(&self, principal: &Principal, action: Action, resource: &Resource) -> Decision {
        if self.cfg.allow_all {
            return Decision {
                allow: true,
                explain: base_explain(action, resource, "allow_all"),
            };
        }

        let reviewing = principal.membership(resource.org_id);
        let submitting = principal.membership(resource.submitted_by_org_id);

        let (allow, reason) = match action {
            Action::View => (
                reviewing.is_some() || submitting.is_some(),
                "org_member",
            ),
            Action::Create | Action::Update | Action::Submit => (
                submitting.map(|m| m.org_kind == OrgKind::Lab).unwrap_or(false),
                "submitting_lab_member",
            ),
            Action::Operate => (reviewing.is_some(), "reviewing_org_member"),
            Action::Review => (
                reviewing.map(|m| m.is_reviewer).unwrap_or(false),
                "reviewing_org_reviewer",
            ),
            Action::Delete => (
                reviewing.map(|m| m.is_admin).unwrap_or(false),
                "reviewing_org_admin",
            ),
        };

        let mut explain = base_explain(action, resource, reason);
        if !allow {
            explain["message"] = json!(format!(
                "Action {} on {:?} requires {}.",
                action.as_str(),
                resource.kind,
                reason
            ));
        }
        Decision { allow, explain }
    }
}

fn base_explain(action: Action, resource: &Resource, mode: &str) -> Value {
    json!({
        "action": action.as_str(),
        "resource": {
            "kind": resource.kind,
            "org_id": resource.org_id,
            "submitted_by_org_id": resource.submitted_by_org_id,
        },
        "mode": mode,
    })
}

fn posture_to_config(posture: &str) -> PolicyConfig {
    match posture.trim().to_ascii_lowercase().as_str() {
        // Dev-friendly: wide open
        "relaxed" => PolicyConfig { allow_all: true },
        // Default: enforce org/role rules
        "standard" => PolicyConfig { allow_all: false },
        _ => posture_to_config("standard"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org_ids() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    fn resource(enclave: Uuid, lab: Uuid) -> Resource {
        Resource {
            kind: ResourceKind::Study,
            org_id: enclave,
            submitted_by_org_id: lab,
        }
    }

    fn lab_member(lab: Uuid) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            memberships: vec![Membership {
                org_id: lab,
                org_kind: OrgKind::Lab,
                is_admin: false,
                is_reviewer: false,
            }],
        }
    }

    fn enclave_member(enclave: Uuid, is_admin: bool, is_reviewer: bool) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            memberships: vec![Membership {
                org_id: enclave,
                org_kind: OrgKind::Enclave,
                is_admin,
                is_reviewer,
            }],
        }
    }

    #[test]
    fn allow_all_short_circuits() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig { allow_all: true });
        let outsider = lab_member(Uuid::new_v4());
        let decision = engine.evaluate(&outsider, Action::Delete, &resource(enclave, lab));
        assert!(decision.allow);
        assert_eq!(decision.explain["mode"], "allow_all");
    }

    #[test]
    fn view_requires_membership_in_either_org() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = resource(enclave, lab);

        assert!(engine.evaluate(&lab_member(lab), Action::View, &res).allow);
        assert!(
            engine
                .evaluate(&enclave_member(enclave, false, false), Action::View, &res)
                .allow
        );
        let denied = engine.evaluate(&lab_member(Uuid::new_v4()), Action::View, &res);
        assert!(!denied.allow);
        assert_eq!(denied.explain["mode"], "org_member");
    }

    #[test]
    fn submit_is_reserved_for_the_lab_side() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = resource(enclave, lab);

        assert!(engine.evaluate(&lab_member(lab), Action::Submit, &res).allow);
        // Enclave members cannot submit on behalf of the lab, reviewer or not.
        assert!(
            !engine
                .evaluate(&enclave_member(enclave, true, true), Action::Submit, &res)
                .allow
        );
    }

    #[test]
    fn review_requires_the_reviewer_flag() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = resource(enclave, lab);

        assert!(
            engine
                .evaluate(&enclave_member(enclave, false, true), Action::Review, &res)
                .allow
        );
        let plain = engine.evaluate(&enclave_member(enclave, false, false), Action::Review, &res);
        assert!(!plain.allow);
        assert!(plain.explain["message"]
            .as_str()
            .unwrap_or_default()
            .contains("requires reviewing_org_reviewer"));
        assert!(!engine.evaluate(&lab_member(lab), Action::Review, &res).allow);
    }

    #[test]
    fn operate_accepts_any_reviewing_org_member() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = resource(enclave, lab);

        assert!(
            engine
                .evaluate(&enclave_member(enclave, false, false), Action::Operate, &res)
                .allow
        );
        assert!(!engine.evaluate(&lab_member(lab), Action::Operate, &res).allow);
    }

    #[test]
    fn delete_requires_the_admin_flag() {
        let (enclave, lab) = org_ids();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = resource(enclave, lab);

        assert!(
            engine
                .evaluate(&enclave_member(enclave, true, false), Action::Delete, &res)
                .allow
        );
        assert!(
            !engine
                .evaluate(&enclave_member(enclave, false, true), Action::Delete, &res)
                .allow
        );
    }

    #[test]
    fn lab_membership_in_an_enclave_org_cannot_create() {
        // A membership in the reviewing org does not grant lab-side actions
        // even if the org id happens to match the submitting slot.
        let org = Uuid::new_v4();
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        let res = Resource {
            kind: ResourceKind::Study,
            org_id: org,
            submitted_by_org_id: org,
        };
        let principal = enclave_member(org, true, true);
        assert!(!engine.evaluate(&principal, Action::Create, &res).allow);
    }
}
