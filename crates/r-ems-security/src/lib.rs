//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Security policies for channel configuration and value access."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Permission model consulted by the channel manager before configuration
//! changes and value access.

pub mod rbac;

pub use rbac::{Permission, RbacEngine, RbacError, Role};
