//! Data types exchanged with a versioning server.
//!
//! This crate contains the serde-serializable types a transport hands to the
//! session layer while a command runs: error and info messages, tagged
//! records, raw text/binary payloads, and the handshake metadata a server
//! reports when a connection is opened.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization and small accessors
//! * Transport neutral: Any engine that can produce these shapes plugs in
//! * Stable: Changes only when the server contract changes
//!
//! Session, registry and cancellation logic live in `p4-rs`.

pub mod codes;
pub mod message;
pub mod reply;
pub mod server;

pub use message::*;
pub use reply::*;
pub use server::*;
