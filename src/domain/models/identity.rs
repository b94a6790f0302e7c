//! Caller identity, roles, and the closed permission set.
//!
//! Authentication happens upstream; the engine consumes an
//! already-validated identity and only decides authorization.

use serde::{Deserialize, Serialize};

/// The closed set of permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ProcessCreate,
    ProcessRead,
    ProcessUpdate,
    ProcessDelete,
    ProcessPublish,
    ExecutionTrigger,
    ExecutionView,
    ExecutionCancel,
    ExecutionRetry,
    ApprovalDecide,
    ApprovalDelegate,
    ScheduleManage,
    ScheduleView,
    AdminViewAll,
    AdminManageLimits,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessCreate => "process.create",
            Self::ProcessRead => "process.read",
            Self::ProcessUpdate => "process.update",
            Self::ProcessDelete => "process.delete",
            Self::ProcessPublish => "process.publish",
            Self::ExecutionTrigger => "execution.trigger",
            Self::ExecutionView => "execution.view",
            Self::ExecutionCancel => "execution.cancel",
            Self::ExecutionRetry => "execution.retry",
            Self::ApprovalDecide => "approval.decide",
            Self::ApprovalDelegate => "approval.delegate",
            Self::ScheduleManage => "schedule.manage",
            Self::ScheduleView => "schedule.view",
            Self::AdminViewAll => "admin.view_all",
            Self::AdminManageLimits => "admin.manage_limits",
        }
    }
}

/// Predefined roles with fixed permission sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Designer,
    Operator,
    Viewer,
    Approver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Designer => "designer",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
            Self::Approver => "approver",
            Self::Admin => "admin",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "designer" => Some(Self::Designer),
            "operator" => Some(Self::Operator),
            "viewer" => Some(Self::Viewer),
            "approver" => Some(Self::Approver),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Fixed permission set of this role. Viewer and approver are further
    /// scope-restricted by the authorization service.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::Designer => &[
                Permission::ProcessCreate,
                Permission::ProcessRead,
                Permission::ProcessUpdate,
                Permission::ProcessDelete,
                Permission::ProcessPublish,
                Permission::ExecutionView,
            ],
            Self::Operator => &[
                Permission::ProcessRead,
                Permission::ExecutionTrigger,
                Permission::ExecutionView,
                Permission::ExecutionCancel,
                Permission::ExecutionRetry,
                Permission::ScheduleManage,
                Permission::ScheduleView,
            ],
            Self::Viewer => &[Permission::ProcessRead, Permission::ExecutionView],
            Self::Approver => &[
                Permission::ApprovalDecide,
                Permission::ApprovalDelegate,
                Permission::ExecutionView,
            ],
            Self::Admin => &[
                Permission::ProcessCreate,
                Permission::ProcessRead,
                Permission::ProcessUpdate,
                Permission::ProcessDelete,
                Permission::ProcessPublish,
                Permission::ExecutionTrigger,
                Permission::ExecutionView,
                Permission::ExecutionCancel,
                Permission::ExecutionRetry,
                Permission::ApprovalDecide,
                Permission::ApprovalDelegate,
                Permission::ScheduleManage,
                Permission::ScheduleView,
                Permission::AdminViewAll,
                Permission::AdminManageLimits,
            ],
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub team: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, team: impl Into<String>, role: Role) -> Self {
        Self { user_id: user_id.into(), team: team.into(), role }
    }

    /// The engine's own identity for internally triggered operations.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            team: "system".to_string(),
            role: Role::Admin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_permission_matrix() {
        assert!(Role::Designer.has_permission(Permission::ProcessPublish));
        assert!(!Role::Designer.has_permission(Permission::ExecutionTrigger));
        assert!(Role::Operator.has_permission(Permission::ExecutionCancel));
        assert!(!Role::Operator.has_permission(Permission::ProcessPublish));
        assert!(Role::Viewer.has_permission(Permission::ExecutionView));
        assert!(!Role::Viewer.has_permission(Permission::ExecutionCancel));
        assert!(Role::Approver.has_permission(Permission::ApprovalDecide));
        assert!(!Role::Approver.has_permission(Permission::ExecutionTrigger));
        assert!(Role::Admin.has_permission(Permission::AdminViewAll));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::from_str("Admin"), Some(Role::Admin));
        assert_eq!(Role::from_str("root"), None);
    }
}
