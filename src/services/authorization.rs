//! Authorization service: role-based permissions with ownership scoping.
//!
//! Every command consults this service before the engine runs. Denials are
//! appended to the audit log with the caller and the permission they lacked.

use std::sync::Arc;
use tracing::debug;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{AuditEntry, CallerIdentity, Permission, Role};
use crate::domain::ports::AuditRepository;

/// The resource an operation targets, for scope checks.
#[derive(Debug, Clone, Default)]
pub struct AuthScope {
    pub resource_type: &'static str,
    pub resource_id: String,
    pub owner_team: Option<String>,
    pub owner_user: Option<String>,
    /// Approver list, for approval decisions.
    pub approvers: Vec<String>,
}

impl AuthScope {
    pub fn execution(id: impl Into<String>, owner_team: &str, owner_user: &str) -> Self {
        Self {
            resource_type: "execution",
            resource_id: id.into(),
            owner_team: Some(owner_team.to_string()),
            owner_user: Some(owner_user.to_string()),
            approvers: Vec::new(),
        }
    }

    pub fn process(id: impl Into<String>, owner_team: &str) -> Self {
        Self {
            resource_type: "process",
            resource_id: id.into(),
            owner_team: Some(owner_team.to_string()),
            owner_user: None,
            approvers: Vec::new(),
        }
    }

    pub fn approval(id: impl Into<String>, approvers: &[String]) -> Self {
        Self {
            resource_type: "approval",
            resource_id: id.into(),
            owner_team: None,
            owner_user: None,
            approvers: approvers.to_vec(),
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    pub scope: Option<String>,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into(), scope: None }
    }

    fn allow_scoped(reason: impl Into<String>, scope: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into(), scope: Some(scope.into()) }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: reason.into(), scope: None }
    }
}

/// Role matrix plus ownership scoping.
pub struct AuthorizationService {
    audit: Arc<dyn AuditRepository>,
}

impl AuthorizationService {
    pub fn new(audit: Arc<dyn AuditRepository>) -> Self {
        Self { audit }
    }

    /// Decide whether the caller may perform `permission` on the scoped
    /// resource. Denials are audited.
    pub async fn authorize(
        &self,
        identity: &CallerIdentity,
        permission: Permission,
        scope: Option<&AuthScope>,
    ) -> AccessDecision {
        let decision = self.decide(identity, permission, scope);
        if !decision.allowed {
            let entry = AuditEntry::new(
                &identity.user_id,
                "authorization.deny",
                scope.map_or("system", |s| s.resource_type),
                scope.map_or_else(|| "-".to_string(), |s| s.resource_id.clone()),
            )
            .with_details(serde_json::json!({
                "permission": permission.as_str(),
                "role": identity.role.as_str(),
                "reason": decision.reason,
            }));
            if let Err(e) = self.audit.append(&entry).await {
                tracing::warn!(error = %e, "failed to audit authorization denial");
            }
        }
        decision
    }

    /// `authorize`, mapped onto the error taxonomy.
    pub async fn require(
        &self,
        identity: &CallerIdentity,
        permission: Permission,
        scope: Option<&AuthScope>,
    ) -> EngineResult<()> {
        let decision = self.authorize(identity, permission, scope).await;
        if decision.allowed {
            Ok(())
        } else {
            Err(EngineError::AuthorizationDenied { reason: decision.reason })
        }
    }

    fn decide(
        &self,
        identity: &CallerIdentity,
        permission: Permission,
        scope: Option<&AuthScope>,
    ) -> AccessDecision {
        if !identity.role.has_permission(permission) {
            debug!(
                user = %identity.user_id,
                role = %identity.role.as_str(),
                permission = %permission.as_str(),
                "permission not in role"
            );
            return AccessDecision::deny(format!(
                "role {} lacks {}",
                identity.role.as_str(),
                permission.as_str()
            ));
        }

        // Admin bypasses scope restrictions.
        if identity.role == Role::Admin {
            return AccessDecision::allow("admin");
        }

        match (identity.role, permission, scope) {
            // Viewers only see their own executions (or their team's).
            (Role::Viewer, Permission::ExecutionView, Some(scope)) => {
                let own_user = scope.owner_user.as_deref() == Some(identity.user_id.as_str());
                let own_team = scope.owner_team.as_deref() == Some(identity.team.as_str());
                if own_user || own_team {
                    AccessDecision::allow_scoped("owner", "own")
                } else {
                    AccessDecision::deny("viewers see only their own executions")
                }
            }
            // Approvers decide only approvals naming them.
            (Role::Approver, Permission::ApprovalDecide | Permission::ApprovalDelegate, Some(scope)) => {
                if scope.approvers.iter().any(|a| a == &identity.user_id) {
                    AccessDecision::allow_scoped("listed approver", "approver")
                } else {
                    AccessDecision::deny("caller is not an approver of this request")
                }
            }
            _ => AccessDecision::allow("role grant"),
        }
    }
}
