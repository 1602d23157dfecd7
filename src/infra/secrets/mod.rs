//! Secrets runtime and migration core.
//!
//! Resolves declarative secret references (`{ source: "env" | "file", id }`)
//! embedded in the gateway config and per-agent auth stores into an
//! in-memory runtime snapshot, and mechanically rewrites plaintext
//! credentials into reference form backed by a sops-encrypted file.

pub mod backup;
pub mod env_file;
pub mod migrate;
pub mod pointer;
pub mod reload;
pub mod resolver;
pub mod snapshot;
pub mod sops;

pub use migrate::{
    apply_migration_plan, build_migration_plan, rollback_migration, MigrationCounters,
    MigrationOutcome, MigrationPlan, MigrationSettings,
};
pub use reload::{ActivationTrigger, SecretsActivator, SECRETS_ACTIVATOR};
pub use resolver::{
    resolve_secret_ref_string, resolve_secret_ref_value, SecretRef, SecretRefResolveCache,
    SecretResolveContext,
};
pub use snapshot::{prepare_snapshot, PrepareSnapshotParams, RuntimeSnapshot, SnapshotWarning};
