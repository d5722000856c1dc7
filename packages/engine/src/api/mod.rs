// packages/engine/src/api/mod.rs
//! External control surface

pub mod http;

pub use http::{permissions, ApiServer, PRINCIPAL_HEADER};
