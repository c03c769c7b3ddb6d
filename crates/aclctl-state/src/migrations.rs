//! SurrealDB schema migrations and initialization
//!
//! Sets up every table with the indexes the storage traits rely on.
//! The unique indexes are the backstop for the ledger's gapless sequence
//! and the policy version counter: a racing writer that slips past the
//! optimistic check still fails on insert.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all aclctl tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing aclctl SurrealDB schema");

    run(db, "artifacts", ARTIFACTS).await?;
    run(db, "policies", POLICIES).await?;
    run(db, "devices", DEVICES).await?;
    run(db, "revisions", REVISIONS).await?;
    run(db, "jobs", JOBS).await?;
    run(db, "leases", LEASES).await?;
    run(db, "pipelines", PIPELINES).await?;

    info!("aclctl schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    debug!(table, "Initializing table");
    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    info!("✓ {} table initialized", table);
    Ok(())
}

/// `artifacts`: keyed by fingerprint (record id), overwritten by UPSERT.
const ARTIFACTS: &str = r#"
    DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS idx_artifact_fp ON TABLE artifacts COLUMNS fingerprint UNIQUE;
    DEFINE INDEX IF NOT EXISTS idx_artifact_policy ON TABLE artifacts COLUMNS policy_key;
"#;

/// `policies`: one row per (policy_key, version).
const POLICIES: &str = r#"
    DEFINE TABLE IF NOT EXISTS policies SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS idx_policy_version ON TABLE policies COLUMNS policy_key, version UNIQUE;
"#;

/// `devices`: keyed by device id (record id).
const DEVICES: &str = r#"
    DEFINE TABLE IF NOT EXISTS devices SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS idx_device_id ON TABLE devices COLUMNS device_id UNIQUE;
"#;

/// `revisions`: append-only; `(device_id, policy_key, seq)` is unique.
const REVISIONS: &str = r#"
    DEFINE TABLE IF NOT EXISTS revisions SCHEMALESS
        PERMISSIONS
            FOR create FULL
            FOR read FULL
            FOR update FULL
            FOR delete NONE;
    DEFINE INDEX IF NOT EXISTS idx_revision_seq ON TABLE revisions COLUMNS device_id, policy_key, seq UNIQUE;
    DEFINE INDEX IF NOT EXISTS idx_revision_id ON TABLE revisions COLUMNS revision_id UNIQUE;
"#;

/// `jobs`: keyed by job id; `version` drives compare-and-set.
const JOBS: &str = r#"
    DEFINE TABLE IF NOT EXISTS jobs SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS idx_job_state_ready ON TABLE jobs COLUMNS state, ready_at;
    DEFINE INDEX IF NOT EXISTS idx_job_created ON TABLE jobs COLUMNS created_at;
"#;

/// `leases`: one row per held device, keyed by device id.
const LEASES: &str = r#"
    DEFINE TABLE IF NOT EXISTS leases SCHEMALESS;
"#;

/// `pipelines`: keyed by pipeline id.
const PIPELINES: &str = r#"
    DEFINE TABLE IF NOT EXISTS pipelines SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS idx_pipeline_device ON TABLE pipelines COLUMNS device_id, created_at;
"#;
