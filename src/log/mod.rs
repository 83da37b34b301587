//! Logging and observability
//!
//! Append-only JSONL logging of turn execution history.

pub mod jsonl;

pub use jsonl::{JsonlLogger, TurnRecord};
