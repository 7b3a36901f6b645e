//! # Mock CANopen Node
//!
//! A simulated CANopen device used to exercise the master engine: an
//! SDO server over a configurable object dictionary, NMT command
//! handling with boot-up announcements, and periodic heartbeats.
//!
//! The protocol core is transport-agnostic (`Frame` in, `Frame`s out),
//! so the engine's integration tests drive it over an in-memory bus
//! while the `mock-node` binary runs it on a real or virtual CAN
//! interface.

pub mod node;
pub mod object_dictionary;

pub use node::MockNode;
pub use object_dictionary::{ObjectDictionary, ObjectEntry};
