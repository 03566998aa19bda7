//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory reference drivers for field device channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Protocol drivers implementing the channel driver contract.

pub mod iec104;
pub mod modbus;

pub use iec104::Iec104Driver;
pub use modbus::{ModbusDriver, RegisterAddress, RegisterKind};
