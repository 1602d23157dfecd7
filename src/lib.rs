//! OpenClaw gateway secrets runtime and migration core.
//!
//! Turns declarative secret references embedded in the gateway config and
//! per-agent auth-profile stores into a fully-resolved in-memory snapshot,
//! and mechanically rewrites plaintext credentials into reference form
//! backed by a sops-encrypted secrets file, with manifest-backed rollback.

pub mod agents;
pub mod cli;
pub mod config;
pub mod infra;
pub mod logging;
