use serde::{Deserialize, Serialize};

use crate::model::{Brand, Id};

/// A user group an entity or concept can be shared with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Id,
    pub name: String,
}

/// Authenticated (or anonymous) caller identity used by every permission
/// derivation. Permission checks are pure functions of this plus the row
/// under inspection; nothing else request-scoped is consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub groups: Vec<Id>,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_moderator: bool,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            groups: Vec::new(),
            is_superuser: false,
            is_moderator: false,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            groups: Vec::new(),
            is_superuser: false,
            is_moderator: false,
        }
    }

    pub fn moderator(user_id: &str) -> Self {
        Self {
            is_moderator: true,
            ..Self::user(user_id)
        }
    }

    pub fn superuser(user_id: &str) -> Self {
        Self {
            is_superuser: true,
            ..Self::user(user_id)
        }
    }

    pub fn with_groups(mut self, groups: Vec<Id>) -> Self {
        self.groups = groups;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_member_of(&self, group_id: Id) -> bool {
        self.groups.contains(&group_id)
    }

    pub fn is_owner(&self, owner_id: &str) -> bool {
        self.user_id.as_deref() == Some(owner_id)
    }

    /// Audit-trail identity; anonymous writers are rejected upstream.
    pub fn audit_id(&self) -> String {
        self.user_id.clone().unwrap_or_else(|| "anonymous".to_string())
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Per-request context: caller identity plus the brand derived from the
/// request host or route.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: UserContext,
    pub brand: Option<Brand>,
}

impl RequestContext {
    pub fn new(user: UserContext, brand: Option<Brand>) -> Self {
        Self { user, brand }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}
