//! PostgreSQL metadata store
//!
//! Elements and relationships live in two tables with JSONB properties. The
//! claim compare-and-set is a single conditional `UPDATE`, so PostgreSQL's row
//! locking makes it atomic across every engine host sharing the database.

use super::{
    Element, MetadataStore, Pagination, Properties, Relationship, RelationshipDirection,
    PropertyCondition, SearchCriteria, UpdateMode,
};
use crate::config::DatabaseConfig;
use crate::error::AppError;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

const ELEMENT_COLUMNS: &str = "guid, type_name, properties, classifications, version, \
     created_by, updated_by, created_at, updated_at";

const RELATIONSHIP_COLUMNS: &str =
    "guid, type_name, end1_guid, end2_guid, properties, version, created_at, updated_at";

type SqlParam = Box<dyn ToSql + Sync + Send>;

pub struct PostgresMetadataStore {
    pool: Pool,
}

impl PostgresMetadataStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration, verify it and create the tables
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_pool_size));

        let pool = if config.require_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))?
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
                .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?
        };

        let client = pool.get().await?;
        client.query_one("SELECT 1 as ok", &[]).await?;
        drop(client);

        info!("Metadata store connection successful (TLS: {})", config.require_tls);

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the element and relationship tables if they don't exist
    pub async fn init_schema(&self) -> Result<(), AppError> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS metadata_elements (
                    seq BIGSERIAL,
                    guid TEXT PRIMARY KEY,
                    type_name TEXT NOT NULL,
                    properties JSONB NOT NULL DEFAULT '{}'::jsonb,
                    classifications JSONB NOT NULL DEFAULT '{}'::jsonb,
                    version BIGINT NOT NULL DEFAULT 1,
                    created_by TEXT,
                    updated_by TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE TABLE IF NOT EXISTS metadata_relationships (
                    seq BIGSERIAL,
                    guid TEXT PRIMARY KEY,
                    type_name TEXT NOT NULL,
                    end1_guid TEXT NOT NULL,
                    end2_guid TEXT NOT NULL,
                    properties JSONB NOT NULL DEFAULT '{}'::jsonb,
                    version BIGINT NOT NULL DEFAULT 1,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS idx_metadata_elements_type ON metadata_elements(type_name, seq);
                CREATE INDEX IF NOT EXISTS idx_metadata_relationships_end1 ON metadata_relationships(end1_guid, type_name);
                CREATE INDEX IF NOT EXISTS idx_metadata_relationships_end2 ON metadata_relationships(end2_guid, type_name);",
            )
            .await?;

        info!("Metadata store tables initialized");
        Ok(())
    }
}

fn row_to_element(row: &Row) -> Result<Element, AppError> {
    let properties: Value = row.get("properties");
    let classifications: Value = row.get("classifications");
    let version: i64 = row.get("version");

    Ok(Element {
        guid: row.get("guid"),
        type_name: row.get("type_name"),
        properties: into_properties(properties)?,
        classifications: serde_json::from_value::<HashMap<String, Properties>>(classifications)
            .map_err(|e| AppError::PropertyServerFailure(format!("Malformed classifications: {}", e)))?,
        version: version as u64,
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_relationship(row: &Row) -> Result<Relationship, AppError> {
    let properties: Value = row.get("properties");
    let version: i64 = row.get("version");

    Ok(Relationship {
        guid: row.get("guid"),
        type_name: row.get("type_name"),
        end1_guid: row.get("end1_guid"),
        end2_guid: row.get("end2_guid"),
        properties: into_properties(properties)?,
        version: version as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn into_properties(value: Value) -> Result<Properties, AppError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Properties::new()),
        other => Err(AppError::PropertyServerFailure(format!(
            "Expected a JSON object for properties, found {}",
            other
        ))),
    }
}

/// Translate search criteria into a WHERE clause over the JSONB properties
fn build_search(type_name: &str, criteria: &SearchCriteria, pagination: Pagination) -> (String, Vec<SqlParam>) {
    let mut sql = format!(
        "SELECT {} FROM metadata_elements WHERE type_name = $1",
        ELEMENT_COLUMNS
    );
    let mut params: Vec<SqlParam> = vec![Box::new(type_name.to_string())];

    for (name, condition) in &criteria.conditions {
        params.push(Box::new(name.clone()));
        let key = params.len();
        match condition {
            PropertyCondition::Equals(value) => {
                params.push(Box::new(value.clone()));
                sql.push_str(&format!(
                    " AND properties -> ${}::text = ${}::jsonb",
                    key,
                    params.len()
                ));
            }
            PropertyCondition::IsNull => {
                sql.push_str(&format!(
                    " AND COALESCE(properties -> ${}::text, 'null'::jsonb) = 'null'::jsonb",
                    key
                ));
            }
            PropertyCondition::OneOf(values) => {
                params.push(Box::new(Value::Array(values.clone())));
                sql.push_str(&format!(
                    " AND jsonb_build_array(properties -> ${}::text) <@ ${}::jsonb",
                    key,
                    params.len()
                ));
            }
            PropertyCondition::Contains(value) => {
                params.push(Box::new(Value::Array(vec![value.clone()])));
                sql.push_str(&format!(
                    " AND properties -> ${}::text @> ${}::jsonb",
                    key,
                    params.len()
                ));
            }
        }
    }

    sql.push_str(" ORDER BY seq");
    params.push(Box::new(pagination.start_from as i64));
    sql.push_str(&format!(" OFFSET ${}", params.len()));
    if pagination.page_size > 0 {
        params.push(Box::new(pagination.page_size as i64));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
    }

    (sql, params)
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn create_element(
        &self,
        user_id: &str,
        type_name: &str,
        properties: Properties,
    ) -> Result<String, AppError> {
        let client = self.pool.get().await?;
        let guid = Uuid::new_v4().to_string();

        client
            .execute(
                "INSERT INTO metadata_elements (guid, type_name, properties, created_by)
                 VALUES ($1, $2, $3, $4)",
                &[&guid, &type_name, &Value::Object(properties), &user_id],
            )
            .await?;

        debug!("Created {} element {}", type_name, guid);
        Ok(guid)
    }

    async fn get_element(&self, _user_id: &str, guid: &str) -> Result<Element, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM metadata_elements WHERE guid = $1", ELEMENT_COLUMNS),
                &[&guid],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))?;

        row_to_element(&row)
    }

    async fn update_element_properties(
        &self,
        user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Element, AppError> {
        let client = self.pool.get().await?;
        let assignment = match mode {
            UpdateMode::Merge => "properties = properties || $2::jsonb",
            UpdateMode::Replace => "properties = $2::jsonb",
        };

        let row = client
            .query_opt(
                &format!(
                    "UPDATE metadata_elements
                     SET {}, version = version + 1, updated_by = $3, updated_at = now()
                     WHERE guid = $1
                     RETURNING {}",
                    assignment, ELEMENT_COLUMNS
                ),
                &[&guid, &Value::Object(properties), &user_id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))?;

        row_to_element(&row)
    }

    async fn delete_element(&self, _user_id: &str, guid: &str) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM metadata_elements WHERE guid = $1", &[&guid])
            .await?;

        if deleted == 0 {
            return Err(AppError::NotFound(format!("Element {} not found", guid)));
        }
        Ok(())
    }

    async fn classify_element(
        &self,
        user_id: &str,
        guid: &str,
        classification: &str,
        properties: Properties,
    ) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE metadata_elements
                 SET classifications = jsonb_set(classifications, ARRAY[$2::text], $3::jsonb, true),
                     version = version + 1, updated_by = $4, updated_at = now()
                 WHERE guid = $1",
                &[&guid, &classification, &Value::Object(properties), &user_id],
            )
            .await?;

        if updated == 0 {
            return Err(AppError::NotFound(format!("Element {} not found", guid)));
        }
        Ok(())
    }

    async fn find_elements(
        &self,
        _user_id: &str,
        type_name: &str,
        criteria: &SearchCriteria,
        pagination: Pagination,
    ) -> Result<Vec<Element>, AppError> {
        let client = self.pool.get().await?;
        let (sql, params) = build_search(type_name, criteria, pagination);
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = client.query(&sql, &refs).await?;
        rows.iter().map(row_to_element).collect()
    }

    async fn compare_and_set_property(
        &self,
        user_id: &str,
        guid: &str,
        property: &str,
        expected: Option<Value>,
        new_value: Value,
        also: Properties,
    ) -> Result<bool, AppError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE metadata_elements
                 SET properties = jsonb_set(properties || $6::jsonb, ARRAY[$2::text], $3::jsonb, true),
                     version = version + 1, updated_by = $4, updated_at = now()
                 WHERE guid = $1
                   AND COALESCE(properties -> $2::text, 'null'::jsonb) = COALESCE($5::jsonb, 'null'::jsonb)",
                &[&guid, &property, &new_value, &user_id, &expected, &Value::Object(also)],
            )
            .await?;

        if updated == 1 {
            return Ok(true);
        }

        let exists = client
            .query_opt("SELECT 1 FROM metadata_elements WHERE guid = $1", &[&guid])
            .await?
            .is_some();
        if !exists {
            return Err(AppError::NotFound(format!("Element {} not found", guid)));
        }
        Ok(false)
    }

    async fn create_relationship(
        &self,
        _user_id: &str,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: Properties,
    ) -> Result<String, AppError> {
        let client = self.pool.get().await?;
        let guid = Uuid::new_v4().to_string();

        let inserted = client
            .execute(
                "INSERT INTO metadata_relationships (guid, type_name, end1_guid, end2_guid, properties)
                 SELECT $1, $2, $3, $4, $5
                 WHERE EXISTS (SELECT 1 FROM metadata_elements WHERE guid = $3)
                   AND EXISTS (SELECT 1 FROM metadata_elements WHERE guid = $4)",
                &[&guid, &type_name, &end1_guid, &end2_guid, &Value::Object(properties)],
            )
            .await?;

        if inserted == 0 {
            return Err(AppError::InvalidParameter(format!(
                "Relationship ends {} and {} must both exist",
                end1_guid, end2_guid
            )));
        }

        debug!("Created {} relationship {} ({} -> {})", type_name, guid, end1_guid, end2_guid);
        Ok(guid)
    }

    async fn get_relationship(&self, _user_id: &str, guid: &str) -> Result<Relationship, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM metadata_relationships WHERE guid = $1",
                    RELATIONSHIP_COLUMNS
                ),
                &[&guid],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", guid)))?;

        row_to_relationship(&row)
    }

    async fn update_relationship_properties(
        &self,
        _user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Relationship, AppError> {
        let client = self.pool.get().await?;
        let assignment = match mode {
            UpdateMode::Merge => "properties = properties || $2::jsonb",
            UpdateMode::Replace => "properties = $2::jsonb",
        };

        let row = client
            .query_opt(
                &format!(
                    "UPDATE metadata_relationships
                     SET {}, version = version + 1, updated_at = now()
                     WHERE guid = $1
                     RETURNING {}",
                    assignment, RELATIONSHIP_COLUMNS
                ),
                &[&guid, &Value::Object(properties)],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", guid)))?;

        row_to_relationship(&row)
    }

    async fn delete_relationship(&self, _user_id: &str, guid: &str) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM metadata_relationships WHERE guid = $1", &[&guid])
            .await?;

        if deleted == 0 {
            return Err(AppError::NotFound(format!("Relationship {} not found", guid)));
        }
        Ok(())
    }

    async fn get_relationships(
        &self,
        _user_id: &str,
        guid: &str,
        type_name: &str,
        direction: RelationshipDirection,
    ) -> Result<Vec<Relationship>, AppError> {
        let client = self.pool.get().await?;
        let filter = match direction {
            RelationshipDirection::Outgoing => "end1_guid = $1",
            RelationshipDirection::Incoming => "end2_guid = $1",
            RelationshipDirection::Either => "(end1_guid = $1 OR end2_guid = $1)",
        };

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM metadata_relationships WHERE {} AND type_name = $2 ORDER BY seq",
                    RELATIONSHIP_COLUMNS, filter
                ),
                &[&guid, &type_name],
            )
            .await?;

        rows.iter().map(row_to_relationship).collect()
    }
}
