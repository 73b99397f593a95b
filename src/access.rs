#![forbid(unsafe_code)]

//! Per-user read filters.
//!
//! A user holding the stage's global read permission sees everything and gets
//! no filter. Everyone else is limited to the spaces they can read plus the
//! instances they were explicitly invited to.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{Result, SpaceName, Stage};

/// An operation a permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Functionality {
    /// Read in-progress data.
    Read,
    /// Read released data.
    ReadReleased,
    /// Write in-progress data.
    Write,
    /// Release data.
    Release,
    /// Invite other users to an instance.
    Invite,
}

impl Functionality {
    /// Read functionality for a stage. Native data has none.
    pub fn read_for(stage: Stage) -> Option<Functionality> {
        match stage {
            Stage::InProgress => Some(Functionality::Read),
            Stage::Released => Some(Functionality::ReadReleased),
            Stage::Native => None,
        }
    }
}

/// Where a permission applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionScope {
    /// Every space and instance.
    Global,
    /// One space.
    Space(SpaceName),
    /// One instance, independent of its space.
    Instance(Uuid),
}

/// A granted functionality with its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    /// Granted operation.
    pub functionality: Functionality,
    /// Where it applies.
    pub scope: PermissionScope,
}

impl Permission {
    /// Global grant.
    pub fn global(functionality: Functionality) -> Self {
        Permission {
            functionality,
            scope: PermissionScope::Global,
        }
    }

    /// Space grant.
    pub fn space(functionality: Functionality, space: impl Into<SpaceName>) -> Self {
        Permission {
            functionality,
            scope: PermissionScope::Space(space.into()),
        }
    }

    /// Instance grant.
    pub fn instance(functionality: Functionality, id: Uuid) -> Self {
        Permission {
            functionality,
            scope: PermissionScope::Instance(id),
        }
    }
}

/// An authenticated user and the permissions derived from their roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWithRoles {
    /// Stable user id.
    pub user_id: String,
    /// Effective permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl UserWithRoles {
    /// A user with the given permissions.
    pub fn new(user_id: impl Into<String>, permissions: Vec<Permission>) -> Self {
        UserWithRoles {
            user_id: user_id.into(),
            permissions,
        }
    }

    /// Whether the user holds `functionality` globally.
    pub fn has_global_permission(&self, functionality: Functionality) -> bool {
        self.permissions
            .iter()
            .any(|p| p.functionality == functionality && p.scope == PermissionScope::Global)
    }

    /// Spaces among `candidates` the user holds `functionality` in.
    pub fn spaces_for_permission(
        &self,
        functionality: Functionality,
        candidates: &BTreeSet<SpaceName>,
    ) -> BTreeSet<SpaceName> {
        if self.has_global_permission(functionality) {
            return candidates.clone();
        }
        self.permissions
            .iter()
            .filter(|p| p.functionality == functionality)
            .filter_map(|p| match &p.scope {
                PermissionScope::Space(space) if candidates.contains(space) => Some(space.clone()),
                _ => None,
            })
            .collect()
    }

    /// Instances the user holds `functionality` on through instance grants.
    pub fn instances_with_explicit_permission(&self, functionality: Functionality) -> BTreeSet<Uuid> {
        self.permissions
            .iter()
            .filter(|p| p.functionality == functionality)
            .filter_map(|p| match p.scope {
                PermissionScope::Instance(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

/// Supplies the identity of the current caller.
pub trait AuthContext: Send + Sync {
    /// The user the current request runs as.
    fn current_user(&self) -> Result<UserWithRoles>;
}

/// An [`AuthContext`] that always returns the same user.
#[derive(Debug, Clone)]
pub struct StaticAuth(pub UserWithRoles);

impl AuthContext for StaticAuth {
    fn current_user(&self) -> Result<UserWithRoles> {
        Ok(self.0.clone())
    }
}

/// Lists the spaces that exist in a stage.
pub trait SpaceDirectory: Send + Sync {
    /// All known spaces.
    fn all_spaces(&self, stage: Stage) -> Result<BTreeSet<SpaceName>>;
}

/// Read restriction: visible when the space is allowed or the instance is
/// explicitly permitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessFilter {
    /// Readable spaces.
    pub allowed_spaces: BTreeSet<SpaceName>,
    /// Instances readable regardless of space.
    pub permitted_instances: BTreeSet<Uuid>,
}

impl AccessFilter {
    /// Whether an instance located in `space` passes the filter.
    pub fn permits(&self, space: &SpaceName, id: &Uuid) -> bool {
        self.allowed_spaces.contains(space) || self.permitted_instances.contains(id)
    }

    /// Whether nothing at all is visible.
    pub fn is_empty(&self) -> bool {
        self.allowed_spaces.is_empty() && self.permitted_instances.is_empty()
    }
}

/// Computes [`AccessFilter`]s from a user's permissions.
#[derive(Clone)]
pub struct AccessFilterResolver {
    spaces: Arc<dyn SpaceDirectory>,
}

impl AccessFilterResolver {
    /// Creates a resolver backed by a space directory.
    pub fn new(spaces: Arc<dyn SpaceDirectory>) -> Self {
        AccessFilterResolver { spaces }
    }

    /// Read filter for `stage`, or `None` when the user reads everything.
    ///
    /// Native data has no read functionality, so every user gets a filter
    /// built from grants that can never match and sees nothing.
    pub fn resolve(
        &self,
        user: &UserWithRoles,
        stage: Stage,
        restriction: Option<&[SpaceName]>,
    ) -> Result<Option<AccessFilter>> {
        match Functionality::read_for(stage) {
            Some(functionality) => self.resolve_for(user, functionality, stage, restriction),
            None => {
                debug!(user = %user.user_id, %stage, "access.resolve.no_read_functionality");
                Ok(Some(AccessFilter::default()))
            }
        }
    }

    /// Filter for an arbitrary functionality, e.g. write.
    pub fn resolve_for(
        &self,
        user: &UserWithRoles,
        functionality: Functionality,
        stage: Stage,
        restriction: Option<&[SpaceName]>,
    ) -> Result<Option<AccessFilter>> {
        if user.has_global_permission(functionality) {
            return Ok(None);
        }
        let candidates: BTreeSet<SpaceName> = match restriction {
            Some(spaces) if !spaces.is_empty() => spaces.iter().cloned().collect(),
            _ => self.spaces.all_spaces(stage)?,
        };
        let filter = AccessFilter {
            allowed_spaces: user.spaces_for_permission(functionality, &candidates),
            permitted_instances: user.instances_with_explicit_permission(functionality),
        };
        debug!(
            user = %user.user_id,
            ?functionality,
            spaces = filter.allowed_spaces.len(),
            instances = filter.permitted_instances.len(),
            "access.resolve.restricted"
        );
        Ok(Some(filter))
    }
}
