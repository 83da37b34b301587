//! Agent Client Protocol integration
//!
//! This module speaks JSON-RPC 2.0 over the stdio of an agent subprocess:
//! framing and routing, the session lifecycle, and the host-side capability
//! handlers (permissions, filesystem, terminals).

pub mod adapter;
pub mod client;
pub mod fs;
pub mod models;
pub mod permissions;
pub mod protocol;
pub mod session;
pub mod terminal;
