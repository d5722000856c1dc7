// packages/engine/src/codec/mod.rs
//! Cross-boundary serialization
//!
//! - **Value**: tagged union of primitives, sequences, mappings and blobs
//! - **Wire**: versioned envelope used by the host/worker protocol

pub mod value;
pub mod wire;

pub use value::{Blob, Value};
pub use wire::{decode, encode, Envelope, WIRE_VERSION};
