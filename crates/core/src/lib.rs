//! privgate-core
//!
//! Core library for static privilege-boundary auditing of executable images.
//!
//! This crate defines the internal IR (model), the classification policy, the
//! four analysis stages, and adapters for the ELF reader and the instruction
//! decoder.
//!
//! All substantive logic lives here so it is fully testable and reusable from
//! multiple frontends; the `privgate` CLI is a thin layer over [`Auditor`].

pub mod analysis;
pub mod backends;
pub mod model;
pub mod policy;
pub mod ranges;
pub mod services;

pub use policy::{PolicyConfig, PolicyError, PrivilegePolicy};
pub use services::{AuditError, AuditOptions, AuditReport, Auditor};

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
