//! SurrealDB Handle - Connection setup
//!
//! Opens a connection, authenticates when needed, selects the namespace and
//! database, and runs schema migrations. Supports in-memory (`mem://`),
//! embedded file (`surrealkv://`) and remote (WebSocket) endpoints.

use crate::error::StateError;
use crate::migrations;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

/// Default namespace for aclctl data
pub const DEFAULT_NAMESPACE: &str = "aclctl";
/// Default database name
pub const DEFAULT_DATABASE: &str = "main";

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://db.example.net")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "aclctl")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "aclctl")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CloudConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("SURREALDB_ENDPOINT").ok_or("SURREALDB_ENDPOINT not set")?;
        let username = lookup("SURREALDB_USERNAME").ok_or("SURREALDB_USERNAME not set")?;
        let password = lookup("SURREALDB_PASSWORD").ok_or("SURREALDB_PASSWORD not set")?;
        let namespace =
            lookup("SURREALDB_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let database = lookup("SURREALDB_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let is_root = lookup("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// SurrealDB connection handle for aclctl
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        Self::setup_url("mem://").await
    }

    /// Connect to an unauthenticated endpoint (`mem://`, `surrealkv://path`)
    #[instrument(skip_all, fields(url = %url))]
    pub async fn setup_url(url: &str) -> Result<Self> {
        info!("Connecting to SurrealDB");

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected and schema initialized");
        Ok(SurrealHandle { db })
    }

    /// Connect to a remote SurrealDB with credentials
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_cloud(config: CloudConfig) -> Result<Self> {
        info!("Connecting to SurrealDB (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected and schema initialized");
        Ok(SurrealHandle { db })
    }

    /// Connect using environment variables.
    ///
    /// Resolution order:
    /// 1. `SURREALDB_ENDPOINT` + credentials (see [`CloudConfig::from_env`])
    /// 2. `SURREALDB_URL` (unauthenticated, e.g. `surrealkv://.aclctl/db`)
    /// 3. `default_url`
    pub async fn setup_from_env(default_url: &str) -> Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::setup_cloud(config).await;
        }
        let url = std::env::var("SURREALDB_URL").unwrap_or_else(|_| default_url.to_string());
        Self::setup_url(&url).await
    }

    /// Underlying client
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }
}
