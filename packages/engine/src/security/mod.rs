// packages/engine/src/security/mod.rs
//! Authorization for the control surface
//!
//! Checked at the edge (HTTP handlers) before anything reaches the runtime.

pub mod permissions;

pub use permissions::{execute_permission, PatternGate, Permission, PermissionGate, Scope, ANY_PRINCIPAL};
