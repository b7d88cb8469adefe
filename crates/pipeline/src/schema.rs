use async_trait::async_trait;
use model::binlog::position::BinlogPosition;
use model::core::column::{parse_enum_labels, CharsetHint, ColumnSchema, SqlType};
use replicator_core::retry::RetryPolicy;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("table {schema}.{table} is not present in the active schema")]
    UnknownTable { schema: String, table: String },

    #[error("row has {values} values but {schema}.{table} has {columns} columns")]
    ColumnCountMismatch {
        schema: String,
        table: String,
        columns: usize,
        values: usize,
    },

    #[error("active schema query failed: {0}")]
    Query(String),
}

/// Column list and primary key of one table, at one schema version.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
    /// Ordinal positions of the primary-key columns, in key order.
    pub primary_key: Vec<usize>,
}

/// The active-schema database: a MySQL mirror replaying the master's DDL,
/// queried to resolve column metadata at the time of each event.
#[async_trait]
pub trait ActiveSchema: Send + Sync {
    async fn table_schema(&self, schema: &str, table: &str) -> Result<TableSchema, SchemaError>;

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, SchemaError>;
}

/// In-memory active schema for trace replay and tests.
#[derive(Debug, Default)]
pub struct FixedActiveSchema {
    tables: HashMap<(String, String), TableSchema>,
}

impl FixedActiveSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables
            .insert((table.schema.clone(), table.table.clone()), table);
    }
}

#[async_trait]
impl ActiveSchema for FixedActiveSchema {
    async fn table_schema(&self, schema: &str, table: &str) -> Result<TableSchema, SchemaError> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| SchemaError::UnknownTable {
                schema: schema.to_string(),
                table: table.to_string(),
            })
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, SchemaError> {
        let mut tables: Vec<String> = self
            .tables
            .keys()
            .filter(|(s, _)| s == schema)
            .map(|(_, t)| t.clone())
            .collect();
        tables.sort();
        Ok(tables)
    }
}

const COLUMNS_QUERY: &str = "\
SELECT column_name AS column_name,
       data_type AS data_type,
       column_type AS column_type,
       character_set_name AS character_set_name,
       datetime_precision AS datetime_precision,
       column_key AS column_key
FROM information_schema.columns
WHERE table_schema = ? AND table_name = ?
ORDER BY ordinal_position";

const TABLES_QUERY: &str = "\
SELECT table_name AS table_name
FROM information_schema.tables
WHERE table_schema = ?
ORDER BY table_name";

/// Active schema backed by a live MySQL mirror.
pub struct MySqlActiveSchema {
    pool: MySqlPool,
}

impl MySqlActiveSchema {
    pub async fn connect(
        host: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, SchemaError> {
        let url = format!("mysql://{user}:{password}@{host}/{database}");
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .map_err(|e| SchemaError::Query(e.to_string()))?;
        info!(host, database, "connected to active schema");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ActiveSchema for MySqlActiveSchema {
    async fn table_schema(&self, schema: &str, table: &str) -> Result<TableSchema, SchemaError> {
        let rows = sqlx::query(COLUMNS_QUERY)
            .bind(schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SchemaError::Query(e.to_string()))?;

        if rows.is_empty() {
            return Err(SchemaError::UnknownTable {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut primary_key = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            let name: String = row
                .try_get("column_name")
                .map_err(|e| SchemaError::Query(e.to_string()))?;
            let data_type: String = row
                .try_get("data_type")
                .map_err(|e| SchemaError::Query(e.to_string()))?;
            let column_type: String = row.try_get("column_type").unwrap_or_default();
            let charset: Option<String> = row.try_get("character_set_name").unwrap_or(None);
            let precision: Option<u32> = row.try_get("datetime_precision").unwrap_or(None);
            let column_key: String = row.try_get("column_key").unwrap_or_default();

            if column_key == "PRI" {
                primary_key.push(position);
            }

            let mut column = ColumnSchema::new(name, SqlType::from_data_type(&data_type))
                .with_charset(CharsetHint::from_name(charset.as_deref()));
            column.precision = precision.map(|p| p as u8);
            column.enum_labels = parse_enum_labels(&column_type);
            columns.push(column);
        }

        Ok(TableSchema {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            primary_key,
        })
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, SchemaError> {
        let rows = sqlx::query(TABLES_QUERY)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SchemaError::Query(e.to_string()))?;
        rows.iter()
            .map(|row| {
                row.try_get("table_name")
                    .map_err(|e| SchemaError::Query(e.to_string()))
            })
            .collect()
    }
}

/// Caches resolved table schemas, versioned by the pre-event binlog
/// position of the DDL that invalidated them. The previous version stays
/// retrievable for row events of the old generation that were already in
/// flight when the DDL landed.
pub struct SchemaCache {
    active: Arc<dyn ActiveSchema>,
    cache: HashMap<(String, String), Arc<TableSchema>>,
    previous: HashMap<(String, String), Arc<TableSchema>>,
    version_position: Option<BinlogPosition>,
}

impl SchemaCache {
    pub fn new(active: Arc<dyn ActiveSchema>) -> Self {
        Self {
            active,
            cache: HashMap::new(),
            previous: HashMap::new(),
            version_position: None,
        }
    }

    /// Seeds the cache with every table of the replicated schema.
    pub async fn seed(&mut self, schema: &str) -> Result<(), SchemaError> {
        let tables = self.active.list_tables(schema).await?;
        info!(schema, tables = tables.len(), "seeding schema cache");
        for table in tables {
            self.get(schema, &table).await?;
        }
        Ok(())
    }

    /// Resolves a table's schema, fetching on miss. A miss is retried a few
    /// times to let a racing DDL land in the active schema.
    pub async fn get(&mut self, schema: &str, table: &str) -> Result<Arc<TableSchema>, SchemaError> {
        let key = (schema.to_string(), table.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Arc::clone(cached));
        }
        let fetched = RetryPolicy::for_schema_refresh()
            .run("active schema lookup", || {
                self.active.table_schema(schema, table)
            })
            .await?;
        let fetched = Arc::new(fetched);
        self.cache.insert(key, Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Drops the cached generation of a schema after a DDL, keying the old
    /// one by the pre-event binlog position.
    pub fn refresh(&mut self, schema: &str, pre_event_position: BinlogPosition) {
        debug!(schema, position = %pre_event_position, "schema cache refresh");
        let stale: Vec<(String, String)> = self
            .cache
            .keys()
            .filter(|(s, _)| s == schema)
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = self.cache.remove(&key) {
                self.previous.insert(key, old);
            }
        }
        self.version_position = Some(pre_event_position);
    }

    /// The schema generation that was current before the last refresh.
    pub fn previous_version(&self, schema: &str, table: &str) -> Option<Arc<TableSchema>> {
        self.previous
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
    }

    pub fn version_position(&self) -> Option<&BinlogPosition> {
        self.version_position.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, name: &str) -> TableSchema {
        TableSchema {
            schema: schema.to_string(),
            table: name.to_string(),
            columns: vec![
                ColumnSchema::new("id", SqlType::Integer),
                ColumnSchema::new("a", SqlType::Integer),
            ],
            primary_key: vec![0],
        }
    }

    #[tokio::test]
    async fn get_caches_after_first_fetch() {
        let active = FixedActiveSchema::new().with_table(table("shop", "t1"));
        let mut cache = SchemaCache::new(Arc::new(active));
        let first = cache.get("shop", "t1").await.unwrap();
        let second = cache.get("shop", "t1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn refresh_keeps_the_previous_generation() {
        let active = FixedActiveSchema::new().with_table(table("shop", "t1"));
        let mut cache = SchemaCache::new(Arc::new(active));
        let original = cache.get("shop", "t1").await.unwrap();

        let position = BinlogPosition::new("mysql-bin.000001", 900);
        cache.refresh("shop", position.clone());

        assert_eq!(cache.version_position(), Some(&position));
        let previous = cache.previous_version("shop", "t1").unwrap();
        assert!(Arc::ptr_eq(&original, &previous));

        // The next get refetches a fresh generation.
        let refetched = cache.get("shop", "t1").await.unwrap();
        assert!(!Arc::ptr_eq(&original, &refetched));
    }

    #[tokio::test]
    async fn unknown_tables_surface_after_retries() {
        let mut cache = SchemaCache::new(Arc::new(FixedActiveSchema::new()));
        let err = cache.get("shop", "missing").await.unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTable { .. }));
    }

    #[tokio::test]
    async fn seed_loads_every_table_of_the_schema() {
        let active = FixedActiveSchema::new()
            .with_table(table("shop", "t1"))
            .with_table(table("shop", "t2"))
            .with_table(table("other", "t3"));
        let mut cache = SchemaCache::new(Arc::new(active));
        cache.seed("shop").await.unwrap();
        assert_eq!(cache.cache.len(), 2);
    }
}
