//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use r_ems_security::{Permission, RbacEngine, RbacError};
use tracing::warn;

use crate::locator::ChannelLocator;

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOperation {
    AddChannel,
    DeleteChannel,
    ReadChannel,
    WriteChannel,
    DiscoverChannels,
}

impl ChannelOperation {
    fn permission(self) -> Permission {
        match self {
            ChannelOperation::AddChannel => Permission::AddChannel,
            ChannelOperation::DeleteChannel => Permission::DeleteChannel,
            ChannelOperation::ReadChannel => Permission::ReadChannel,
            ChannelOperation::WriteChannel => Permission::WriteChannel,
            ChannelOperation::DiscoverChannels => Permission::DiscoverChannels,
        }
    }
}

impl fmt::Display for ChannelOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.permission(), f)
    }
}

/// Access-control collaborator consulted before registry mutations and value access.
pub trait AccessControl: Send + Sync {
    fn authorize(&self, operation: ChannelOperation, channel: &ChannelLocator) -> bool;
}

/// Grants everything. Used when no policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl AccessControl for PermitAll {
    fn authorize(&self, _operation: ChannelOperation, _channel: &ChannelLocator) -> bool {
        true
    }
}

/// Evaluates a fixed set of roles against the RBAC engine, per driver.
#[derive(Debug, Clone)]
pub struct RoleBasedAccess {
    engine: RbacEngine,
    roles: Vec<String>,
}

impl RoleBasedAccess {
    pub fn new(engine: RbacEngine, roles: Vec<String>) -> Self {
        Self { engine, roles }
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }
}

impl AccessControl for RoleBasedAccess {
    fn authorize(&self, operation: ChannelOperation, channel: &ChannelLocator) -> bool {
        match self
            .engine
            .is_authorized(&self.roles, operation.permission(), channel.driver_id())
        {
            Ok(granted) => granted,
            Err(RbacError::UnknownRole(role)) => {
                warn!(%role, %operation, channel = %channel, "unknown role, denying");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::DeviceLocator;
    use r_ems_security::Role;

    fn channel(driver: &str) -> ChannelLocator {
        let device = DeviceLocator::intern(driver, "if0", "access-device", None);
        ChannelLocator::intern(&device, "ch")
    }

    #[test]
    fn operator_cannot_reconfigure() {
        let access = RoleBasedAccess::new(RbacEngine::new(), vec!["operator".into()]);
        assert!(access.authorize(ChannelOperation::WriteChannel, &channel("modbus")));
        assert!(!access.authorize(ChannelOperation::AddChannel, &channel("modbus")));
    }

    #[test]
    fn driver_scoped_roles_follow_locator_driver() {
        let mut engine = RbacEngine::empty();
        engine.insert_role(Role::admin().scoped_to(["iec104"]));
        let access = RoleBasedAccess::new(engine, vec!["admin".into()]);
        assert!(access.authorize(ChannelOperation::AddChannel, &channel("iec104")));
        assert!(!access.authorize(ChannelOperation::AddChannel, &channel("modbus")));
    }

    #[test]
    fn unknown_roles_deny() {
        let access = RoleBasedAccess::new(RbacEngine::new(), vec!["intruder".into()]);
        assert!(!access.authorize(ChannelOperation::ReadChannel, &channel("modbus")));
        assert_eq!(ChannelOperation::DiscoverChannels.to_string(), "discover_channels");
    }
}
