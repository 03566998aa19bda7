//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Security policies for channel configuration and value access."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Permission enumerates the channel operations that are subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Configure a new channel.
    AddChannel,
    /// Remove a configured channel.
    DeleteChannel,
    /// Read sampled values.
    ReadChannel,
    /// Write values to a device.
    WriteChannel,
    /// See channels reported by a driver scan.
    DiscoverChannels,
}

impl Permission {
    /// Every permission known to the engine.
    pub const ALL: [Permission; 5] = [
        Permission::AddChannel,
        Permission::DeleteChannel,
        Permission::ReadChannel,
        Permission::WriteChannel,
        Permission::DiscoverChannels,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Permission::AddChannel => "add_channel",
            Permission::DeleteChannel => "delete_channel",
            Permission::ReadChannel => "read_channel",
            Permission::WriteChannel => "write_channel",
            Permission::DiscoverChannels => "discover_channels",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role describes a named set of permissions, optionally limited to some drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role identifier.
    pub name: String,
    /// Permissions attached to the role.
    pub permissions: HashSet<Permission>,
    /// Driver ids the role applies to. `None` grants the permissions for every driver.
    #[serde(default)]
    pub drivers: Option<BTreeSet<String>>,
}

impl Role {
    /// Built-in admin role with full access.
    pub fn admin() -> Self {
        Self {
            name: "admin".into(),
            permissions: HashSet::from(Permission::ALL),
            drivers: None,
        }
    }

    /// Operator role: may read, write and browse but not change the configuration.
    pub fn operator() -> Self {
        Self {
            name: "operator".into(),
            permissions: HashSet::from([
                Permission::ReadChannel,
                Permission::WriteChannel,
                Permission::DiscoverChannels,
            ]),
            drivers: None,
        }
    }

    /// Viewer role with read-only access.
    pub fn viewer() -> Self {
        Self {
            name: "viewer".into(),
            permissions: HashSet::from([Permission::ReadChannel]),
            drivers: None,
        }
    }

    /// Restrict the role to the given driver ids.
    pub fn scoped_to<I, S>(mut self, drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drivers = Some(drivers.into_iter().map(Into::into).collect());
        self
    }

    fn grants(&self, permission: Permission, driver_id: &str) -> bool {
        self.permissions.contains(&permission)
            && self
                .drivers
                .as_ref()
                .map_or(true, |drivers| drivers.contains(driver_id))
    }
}

/// Errors occurring during RBAC evaluation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RbacError {
    /// Role not defined in the engine.
    #[error("role not found: {0}")]
    UnknownRole(String),
}

/// RBAC engine that stores role definitions and can evaluate permissions.
#[derive(Debug, Clone)]
pub struct RbacEngine {
    roles: HashMap<String, Role>,
}

impl Default for RbacEngine {
    fn default() -> Self {
        let mut engine = Self::empty();
        engine.insert_role(Role::admin());
        engine.insert_role(Role::operator());
        engine.insert_role(Role::viewer());
        engine
    }
}

impl RbacEngine {
    /// Create a store pre-populated with the built-in roles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store without any role definitions.
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    /// Insert or replace a role definition.
    pub fn insert_role(&mut self, role: Role) {
        self.roles.insert(role.name.clone(), role);
    }

    /// Lookup a role by name.
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Determine whether any of the provided role names grant the permission on `driver_id`.
    pub fn is_authorized(
        &self,
        roles: &[String],
        permission: Permission,
        driver_id: &str,
    ) -> Result<bool, RbacError> {
        for role_name in roles {
            let role = self
                .roles
                .get(role_name)
                .ok_or_else(|| RbacError::UnknownRole(role_name.clone()))?;
            if role.grants(permission, driver_id) {
                trace!(role = %role_name, %permission, driver = driver_id, "permission granted");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roles_cover_channel_permissions() {
        let engine = RbacEngine::new();
        assert!(engine
            .is_authorized(&["admin".into()], Permission::AddChannel, "modbus")
            .unwrap());
        assert!(engine
            .is_authorized(&["operator".into()], Permission::WriteChannel, "modbus")
            .unwrap());
        assert!(!engine
            .is_authorized(&["operator".into()], Permission::DeleteChannel, "modbus")
            .unwrap());
        assert!(!engine
            .is_authorized(&["viewer".into()], Permission::WriteChannel, "modbus")
            .unwrap());
    }

    #[test]
    fn scoped_roles_only_apply_to_listed_drivers() {
        let mut engine = RbacEngine::empty();
        engine.insert_role(Role::admin().scoped_to(["iec104"]));
        let roles = vec!["admin".to_owned()];
        assert!(engine
            .is_authorized(&roles, Permission::AddChannel, "iec104")
            .unwrap());
        assert!(!engine
            .is_authorized(&roles, Permission::AddChannel, "modbus")
            .unwrap());
    }

    #[test]
    fn unknown_roles_are_reported() {
        let engine = RbacEngine::new();
        let err = engine
            .is_authorized(&["root".into()], Permission::ReadChannel, "modbus")
            .unwrap_err();
        assert_eq!(err, RbacError::UnknownRole("root".into()));
    }

    #[test]
    fn roles_deserialize_from_json() {
        let role: Role = serde_json::from_str(
            r#"{"name":"meters","permissions":["read_channel"],"drivers":["mbus"]}"#,
        )
        .unwrap();
        assert!(role.grants(Permission::ReadChannel, "mbus"));
        assert!(!role.grants(Permission::ReadChannel, "modbus"));
    }
}
