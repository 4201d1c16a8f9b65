//! Persistent store: typed CRUD for configs, certificates, events, and
//! organization states, backed by an embedded SQLite database in WAL mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gwcp_core::types::{
    ConfigId, ConfigKind, ConfigStatus, Event, EventAction, EventType, LazyResource,
    LazyResourceId, OrgState, Operation, OrganizationId, PolicyInstance, StoredCertificate,
    StoredConfig, Vhosts,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// The JSON-shaped remainder of a `StoredConfig` that has no dedicated
/// column: operations, upstream hosts, vhosts, API-level policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigBody {
    operations: Vec<Operation>,
    upstreams: Vec<gwcp_core::types::UpstreamHost>,
    vhosts: Vhosts,
    #[serde(default)]
    api_level_policies: Vec<PolicyInstance>,
}

/// The persistent store contract. A trait boundary (rather than a
/// concrete `SqliteStore` everywhere) lets tests substitute an in-memory
/// pool and lets §4.C/§4.B depend on behavior, not the SQL engine.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn save_config(&self, config: &StoredConfig) -> Result<()>;
    async fn update_config(&self, config: &StoredConfig) -> Result<()>;
    async fn delete_config(&self, id: ConfigId) -> Result<()>;
    async fn get_config(&self, id: ConfigId) -> Result<StoredConfig>;
    async fn get_config_by_name_version(
        &self,
        display_name: &str,
        version: &str,
    ) -> Result<StoredConfig>;
    async fn get_config_by_handle(&self, handle: &str) -> Result<StoredConfig>;
    async fn list_configs(&self) -> Result<Vec<StoredConfig>>;

    async fn save_certificate(&self, cert: &StoredCertificate) -> Result<()>;
    async fn get_certificate(&self, id: gwcp_core::types::CertificateId) -> Result<StoredCertificate>;
    async fn get_certificate_by_name(&self, name: &str) -> Result<StoredCertificate>;
    async fn list_certificates(&self) -> Result<Vec<StoredCertificate>>;
    async fn delete_certificate(&self, id: gwcp_core::types::CertificateId) -> Result<()>;

    /// Inserts the event row and bumps the org-state's `version_id` in a
    /// single transaction. Returns the freshly generated `version_id`.
    async fn publish_event_atomic(
        &self,
        org: OrganizationId,
        event: NewEvent,
    ) -> Result<Uuid>;

    async fn get_all_states(&self) -> Result<Vec<OrgState>>;
    async fn get_events_since(
        &self,
        org: OrganizationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>>;
    async fn cleanup_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn save_lazy_resource(&self, resource: &LazyResource) -> Result<()>;
    async fn get_lazy_resource(&self, id: LazyResourceId) -> Result<LazyResource>;
    async fn list_lazy_resources(&self) -> Result<Vec<LazyResource>>;
    async fn delete_lazy_resource(&self, id: LazyResourceId) -> Result<()>;
    async fn delete_lazy_resources_by_type(&self, resource_type: &str) -> Result<u64>;
}

/// Fields needed to append an event; `organization_id` and
/// `processed_timestamp` are assigned by the store, not the caller.
pub struct NewEvent {
    pub originated_timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub action: EventAction,
    pub entity_id: String,
    pub event_data: serde_json::Value,
    pub correlation_id: Option<String>,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if absent) the database file at `path`, enables
    /// WAL mode and foreign keys, and applies pending migrations. Refuses
    /// to open a database whose schema is newer than this binary knows —
    /// resolving the open migration-versioning question conservatively.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))
        .map_err(StoreError::Database)?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        Self::from_pool(pool).await
    }

    /// Opens a private, single-connection in-memory database. Used by
    /// tests; `max_connections(1)` keeps every query on the same
    /// connection since SQLite's `:memory:` database is connection-local.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(StoreError::Database)?;

        let known_migrations = sqlx::migrate!("./migrations").migrations.len() as i64;
        let current_version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await
            .map_err(StoreError::Database)?;

        if current_version > known_migrations {
            return Err(StoreError::Core(gwcp_core::Error::Fatal(format!(
                "database schema version {current_version} is newer than {known_migrations} known migrations"
            ))));
        }

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::Migration)?;

        sqlx::query(&format!("PRAGMA user_version = {known_migrations}"))
            .execute(&pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(Self { pool })
    }

    fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> Result<StoredConfig> {
        let body_raw: String = row.try_get("body").map_err(StoreError::Database)?;
        let body: ConfigBody = serde_json::from_str(&body_raw)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?;

        let id_raw: String = row.try_get("id").map_err(StoreError::Database)?;
        let kind_raw: String = row.try_get("kind").map_err(StoreError::Database)?;
        let status_raw: String = row.try_get("status").map_err(StoreError::Database)?;

        Ok(StoredConfig {
            id: id_raw
                .parse()
                .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad config id".into())))?,
            display_name: row.try_get("display_name").map_err(StoreError::Database)?,
            version: row.try_get("version").map_err(StoreError::Database)?,
            handle: row.try_get("handle").map_err(StoreError::Database)?,
            context: row.try_get("context").map_err(StoreError::Database)?,
            kind: parse_kind(&kind_raw)?,
            operations: body.operations,
            upstreams: body.upstreams,
            vhosts: body.vhosts,
            api_level_policies: body.api_level_policies,
            status: parse_status(&status_raw)?,
            created_at: row.try_get("created_at").map_err(StoreError::Database)?,
            updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
            deployed_at: row.try_get("deployed_at").map_err(StoreError::Database)?,
            deployed_version: row.try_get("deployed_version").map_err(StoreError::Database)?,
        })
    }
}

fn kind_str(kind: ConfigKind) -> &'static str {
    match kind {
        ConfigKind::RestApi => "REST_API",
        ConfigKind::WebSubApi => "WEB_SUB_API",
        ConfigKind::Mcp => "MCP",
        ConfigKind::LlmProvider => "LLM_PROVIDER",
        ConfigKind::LlmProxy => "LLM_PROXY",
    }
}

fn parse_kind(raw: &str) -> Result<ConfigKind> {
    Ok(match raw {
        "REST_API" => ConfigKind::RestApi,
        "WEB_SUB_API" => ConfigKind::WebSubApi,
        "MCP" => ConfigKind::Mcp,
        "LLM_PROVIDER" => ConfigKind::LlmProvider,
        "LLM_PROXY" => ConfigKind::LlmProxy,
        other => {
            return Err(StoreError::Core(gwcp_core::Error::Internal(format!(
                "unknown config kind '{other}'"
            ))))
        }
    })
}

fn status_str(status: ConfigStatus) -> &'static str {
    match status {
        ConfigStatus::Pending => "pending",
        ConfigStatus::Deployed => "deployed",
        ConfigStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<ConfigStatus> {
    Ok(match raw {
        "pending" => ConfigStatus::Pending,
        "deployed" => ConfigStatus::Deployed,
        "failed" => ConfigStatus::Failed,
        other => {
            return Err(StoreError::Core(gwcp_core::Error::Internal(format!(
                "unknown config status '{other}'"
            ))))
        }
    })
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn save_config(&self, config: &StoredConfig) -> Result<()> {
        let body = ConfigBody {
            operations: config.operations.clone(),
            upstreams: config.upstreams.clone(),
            vhosts: config.vhosts.clone(),
            api_level_policies: config.api_level_policies.clone(),
        };
        let body_json = serde_json::to_string(&body)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?;

        sqlx::query(
            r#"
            INSERT INTO deployment_configs
                (id, display_name, version, handle, context, kind, body, status,
                 created_at, updated_at, deployed_at, deployed_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(config.id.to_string())
        .bind(&config.display_name)
        .bind(&config.version)
        .bind(&config.handle)
        .bind(&config.context)
        .bind(kind_str(config.kind))
        .bind(body_json)
        .bind(status_str(config.status))
        .bind(config.created_at)
        .bind(config.updated_at)
        .bind(config.deployed_at)
        .bind(config.deployed_version)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Core(gwcp_core::Error::Conflict(format!(
                    "config ({}, {}) already exists",
                    config.display_name, config.version
                )))
            }
            _ => StoreError::Database(e),
        })?;

        Ok(())
    }

    async fn update_config(&self, config: &StoredConfig) -> Result<()> {
        let body = ConfigBody {
            operations: config.operations.clone(),
            upstreams: config.upstreams.clone(),
            vhosts: config.vhosts.clone(),
            api_level_policies: config.api_level_policies.clone(),
        };
        let body_json = serde_json::to_string(&body)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?;

        let result = sqlx::query(
            r#"
            UPDATE deployment_configs
            SET display_name = ?, version = ?, handle = ?, context = ?, kind = ?,
                body = ?, status = ?, updated_at = ?, deployed_at = ?, deployed_version = ?
            WHERE id = ?
            "#,
        )
        .bind(&config.display_name)
        .bind(&config.version)
        .bind(&config.handle)
        .bind(&config.context)
        .bind(kind_str(config.kind))
        .bind(body_json)
        .bind(status_str(config.status))
        .bind(config.updated_at)
        .bind(config.deployed_at)
        .bind(config.deployed_version)
        .bind(config.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Core(gwcp_core::Error::NotFound(format!(
                "config {}",
                config.id
            ))));
        }
        Ok(())
    }

    async fn delete_config(&self, id: ConfigId) -> Result<()> {
        let result = sqlx::query("DELETE FROM deployment_configs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Core(gwcp_core::Error::NotFound(format!(
                "config {id}"
            ))));
        }
        Ok(())
    }

    async fn get_config(&self, id: ConfigId) -> Result<StoredConfig> {
        let row = sqlx::query("SELECT * FROM deployment_configs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?
            .ok_or_else(|| StoreError::Core(gwcp_core::Error::NotFound(format!("config {id}"))))?;

        Self::row_to_config(&row)
    }

    async fn get_config_by_name_version(
        &self,
        display_name: &str,
        version: &str,
    ) -> Result<StoredConfig> {
        let row = sqlx::query(
            "SELECT * FROM deployment_configs WHERE display_name = ? AND version = ?",
        )
        .bind(display_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?
        .ok_or_else(|| {
            StoreError::Core(gwcp_core::Error::NotFound(format!(
                "config ({display_name}, {version})"
            )))
        })?;

        Self::row_to_config(&row)
    }

    async fn get_config_by_handle(&self, handle: &str) -> Result<StoredConfig> {
        let row = sqlx::query("SELECT * FROM deployment_configs WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?
            .ok_or_else(|| {
                StoreError::Core(gwcp_core::Error::NotFound(format!("config handle {handle}")))
            })?;

        Self::row_to_config(&row)
    }

    async fn list_configs(&self) -> Result<Vec<StoredConfig>> {
        let rows = sqlx::query("SELECT * FROM deployment_configs ORDER BY display_name, version")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.iter().map(Self::row_to_config).collect()
    }

    async fn save_certificate(&self, cert: &StoredCertificate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO certificates
                (id, name, pem, subject, issuer, not_before, not_after, chain_length)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cert.id.to_string())
        .bind(&cert.name)
        .bind(&cert.pem)
        .bind(&cert.subject)
        .bind(&cert.issuer)
        .bind(cert.not_before)
        .bind(cert.not_after)
        .bind(cert.chain_length)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Core(gwcp_core::Error::Conflict(format!(
                    "certificate '{}' already exists",
                    cert.name
                )))
            }
            _ => StoreError::Database(e),
        })?;

        Ok(())
    }

    async fn get_certificate(&self, id: gwcp_core::types::CertificateId) -> Result<StoredCertificate> {
        let row = sqlx::query("SELECT * FROM certificates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?
            .ok_or_else(|| StoreError::Core(gwcp_core::Error::NotFound(format!("certificate {id}"))))?;

        row_to_certificate(&row)
    }

    async fn get_certificate_by_name(&self, name: &str) -> Result<StoredCertificate> {
        let row = sqlx::query("SELECT * FROM certificates WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?
            .ok_or_else(|| {
                StoreError::Core(gwcp_core::Error::NotFound(format!("certificate {name}")))
            })?;

        row_to_certificate(&row)
    }

    async fn list_certificates(&self) -> Result<Vec<StoredCertificate>> {
        let rows = sqlx::query("SELECT * FROM certificates ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.iter().map(row_to_certificate).collect()
    }

    async fn delete_certificate(&self, id: gwcp_core::types::CertificateId) -> Result<()> {
        let result = sqlx::query("DELETE FROM certificates WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Core(gwcp_core::Error::NotFound(format!(
                "certificate {id}"
            ))));
        }
        Ok(())
    }

    async fn publish_event_atomic(&self, org: OrganizationId, event: NewEvent) -> Result<Uuid> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let processed_at = Utc::now();
        let new_version = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO events
                (organization_id, processed_timestamp, originated_timestamp, event_type,
                 action, entity_id, event_data, correlation_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(org.to_string())
        .bind(processed_at)
        .bind(event.originated_timestamp)
        .bind(event_type_str(event.event_type))
        .bind(event_action_str(event.action))
        .bind(&event.entity_id)
        .bind(event.event_data.to_string())
        .bind(&event.correlation_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO organization_states (organization_id, version_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(organization_id) DO UPDATE SET version_id = excluded.version_id,
                                                        updated_at = excluded.updated_at
            "#,
        )
        .bind(org.to_string())
        .bind(new_version.to_string())
        .bind(processed_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(new_version)
    }

    async fn get_all_states(&self) -> Result<Vec<OrgState>> {
        let rows = sqlx::query("SELECT organization_id, version_id, updated_at FROM organization_states")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.iter()
            .map(|row| {
                let org_raw: String = row.try_get("organization_id").map_err(StoreError::Database)?;
                let version_raw: String = row.try_get("version_id").map_err(StoreError::Database)?;
                Ok(OrgState {
                    organization_id: org_raw
                        .parse()
                        .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad org id".into())))?,
                    version_id: Uuid::parse_str(&version_raw)
                        .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad version id".into())))?,
                    updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
                })
            })
            .collect()
    }

    async fn get_events_since(
        &self,
        org: OrganizationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE organization_id = ? AND processed_timestamp > ?
            ORDER BY processed_timestamp ASC
            "#,
        )
        .bind(org.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn cleanup_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        // Never delete the newest event for a tenant, even if it predates
        // the cutoff (invariant 6).
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE processed_timestamp < ?
              AND (organization_id, processed_timestamp) NOT IN (
                  SELECT organization_id, MAX(processed_timestamp)
                  FROM events
                  GROUP BY organization_id
              )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(result.rows_affected())
    }

    async fn save_lazy_resource(&self, resource: &LazyResource) -> Result<()> {
        let payload = serde_json::to_string(&resource.payload)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?;

        sqlx::query(
            r#"
            INSERT INTO lazy_resources (id, resource_type, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                resource_type = excluded.resource_type,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(resource.id.to_string())
        .bind(&resource.resource_type)
        .bind(payload)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn get_lazy_resource(&self, id: LazyResourceId) -> Result<LazyResource> {
        let row = sqlx::query("SELECT * FROM lazy_resources WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?
            .ok_or_else(|| StoreError::Core(gwcp_core::Error::NotFound(format!("lazy resource {id}"))))?;

        row_to_lazy_resource(&row)
    }

    async fn list_lazy_resources(&self) -> Result<Vec<LazyResource>> {
        let rows = sqlx::query("SELECT * FROM lazy_resources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.iter().map(row_to_lazy_resource).collect()
    }

    async fn delete_lazy_resource(&self, id: LazyResourceId) -> Result<()> {
        let result = sqlx::query("DELETE FROM lazy_resources WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Core(gwcp_core::Error::NotFound(format!(
                "lazy resource {id}"
            ))));
        }
        Ok(())
    }

    async fn delete_lazy_resources_by_type(&self, resource_type: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM lazy_resources WHERE resource_type = ?")
            .bind(resource_type)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(result.rows_affected())
    }
}

fn row_to_lazy_resource(row: &sqlx::sqlite::SqliteRow) -> Result<LazyResource> {
    let id_raw: String = row.try_get("id").map_err(StoreError::Database)?;
    let payload_raw: String = row.try_get("payload").map_err(StoreError::Database)?;

    Ok(LazyResource {
        id: id_raw
            .parse()
            .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad lazy resource id".into())))?,
        resource_type: row.try_get("resource_type").map_err(StoreError::Database)?,
        payload: serde_json::from_str(&payload_raw)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
    })
}

fn row_to_certificate(row: &sqlx::sqlite::SqliteRow) -> Result<StoredCertificate> {
    let id_raw: String = row.try_get("id").map_err(StoreError::Database)?;
    Ok(StoredCertificate {
        id: id_raw
            .parse()
            .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad certificate id".into())))?,
        name: row.try_get("name").map_err(StoreError::Database)?,
        pem: row.try_get("pem").map_err(StoreError::Database)?,
        subject: row.try_get("subject").map_err(StoreError::Database)?,
        issuer: row.try_get("issuer").map_err(StoreError::Database)?,
        not_before: row.try_get("not_before").map_err(StoreError::Database)?,
        not_after: row.try_get("not_after").map_err(StoreError::Database)?,
        chain_length: row.try_get("chain_length").map_err(StoreError::Database)?,
    })
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let org_raw: String = row.try_get("organization_id").map_err(StoreError::Database)?;
    let type_raw: String = row.try_get("event_type").map_err(StoreError::Database)?;
    let action_raw: String = row.try_get("action").map_err(StoreError::Database)?;
    let data_raw: String = row.try_get("event_data").map_err(StoreError::Database)?;

    Ok(Event {
        organization_id: org_raw
            .parse()
            .map_err(|_| StoreError::Core(gwcp_core::Error::Internal("bad org id".into())))?,
        processed_timestamp: row.try_get("processed_timestamp").map_err(StoreError::Database)?,
        originated_timestamp: row.try_get("originated_timestamp").map_err(StoreError::Database)?,
        event_type: parse_event_type(&type_raw)?,
        action: parse_event_action(&action_raw)?,
        entity_id: row.try_get("entity_id").map_err(StoreError::Database)?,
        event_data: serde_json::from_str(&data_raw)
            .map_err(|e| StoreError::Core(gwcp_core::Error::Internal(e.to_string())))?,
        correlation_id: row.try_get("correlation_id").map_err(StoreError::Database)?,
    })
}

fn event_type_str(t: EventType) -> &'static str {
    match t {
        EventType::Api => "API",
        EventType::Certificate => "CERTIFICATE",
        EventType::LlmTemplate => "LLM_TEMPLATE",
    }
}

fn parse_event_type(raw: &str) -> Result<EventType> {
    Ok(match raw {
        "API" => EventType::Api,
        "CERTIFICATE" => EventType::Certificate,
        "LLM_TEMPLATE" => EventType::LlmTemplate,
        other => {
            return Err(StoreError::Core(gwcp_core::Error::Internal(format!(
                "unknown event type '{other}'"
            ))))
        }
    })
}

fn event_action_str(a: EventAction) -> &'static str {
    match a {
        EventAction::Create => "CREATE",
        EventAction::Update => "UPDATE",
        EventAction::Delete => "DELETE",
    }
}

fn parse_event_action(raw: &str) -> Result<EventAction> {
    Ok(match raw {
        "CREATE" => EventAction::Create,
        "UPDATE" => EventAction::Update,
        "DELETE" => EventAction::Delete,
        other => {
            return Err(StoreError::Core(gwcp_core::Error::Internal(format!(
                "unknown event action '{other}'"
            ))))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_core::types::{ConfigId, UpstreamHost};

    fn sample_config(name: &str, version: &str) -> StoredConfig {
        let now = Utc::now();
        StoredConfig {
            id: ConfigId::new(),
            display_name: name.to_string(),
            version: version.to_string(),
            handle: format!("{name}-{version}"),
            context: format!("/{name}"),
            kind: ConfigKind::RestApi,
            operations: vec![Operation {
                method: "GET".to_string(),
                path: "/us/{city}".to_string(),
                policies: vec![],
            }],
            upstreams: vec![UpstreamHost {
                url: "https://api.example.com/v2".to_string(),
            }],
            vhosts: Vhosts {
                main: "vhost1".to_string(),
                sandbox: None,
            },
            api_level_policies: vec![],
            status: ConfigStatus::Pending,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deployed_version: 0,
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let config = sample_config("weather", "v1");
        store.save_config(&config).await.unwrap();

        let fetched = store.get_config(config.id).await.unwrap();
        assert_eq!(fetched.display_name, "weather");
        assert_eq!(fetched.operations.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_display_name_version_conflicts() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = sample_config("x", "v1");
        let mut b = sample_config("x", "v1");
        b.id = ConfigId::new();
        b.handle = "x-v1-dup".to_string();

        store.save_config(&a).await.unwrap();
        let err = store.save_config(&b).await.unwrap_err();
        assert!(matches!(
            gwcp_core::Error::from(err),
            gwcp_core::Error::Conflict(_)
        ));

        assert_eq!(store.list_configs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_event_atomic_bumps_version_and_appends() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let org = OrganizationId::new();

        let v1 = store
            .publish_event_atomic(
                org,
                NewEvent {
                    originated_timestamp: Utc::now(),
                    event_type: EventType::Api,
                    action: EventAction::Create,
                    entity_id: "cfg-1".to_string(),
                    event_data: serde_json::json!({}),
                    correlation_id: None,
                },
            )
            .await
            .unwrap();

        let states = store.get_all_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].version_id, v1);

        let events = store
            .get_events_since(org, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_preserves_newest_event_per_org() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let org = OrganizationId::new();

        for i in 0..3 {
            store
                .publish_event_atomic(
                    org,
                    NewEvent {
                        originated_timestamp: Utc::now(),
                        event_type: EventType::Api,
                        action: EventAction::Update,
                        entity_id: format!("cfg-{i}"),
                        event_data: serde_json::json!({}),
                        correlation_id: None,
                    },
                )
                .await
                .unwrap();
        }

        let far_future = Utc::now() + chrono::Duration::days(1);
        let deleted = store.cleanup_events_older_than(far_future).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .get_events_since(org, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn lazy_resource_round_trips_and_deletes_by_type() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let resource = gwcp_core::types::LazyResource {
            id: gwcp_core::types::LazyResourceId::new(),
            resource_type: "llm_provider".to_string(),
            payload: serde_json::json!({"model": "gpt-test"}),
            created_at: now,
            updated_at: now,
        };

        store.save_lazy_resource(&resource).await.unwrap();
        let fetched = store.get_lazy_resource(resource.id).await.unwrap();
        assert_eq!(fetched.resource_type, "llm_provider");

        let deleted = store.delete_lazy_resources_by_type("llm_provider").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_lazy_resource(resource.id).await.is_err());
    }
}
