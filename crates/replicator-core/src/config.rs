use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Namespace literal that disables stats emission entirely.
pub const NO_STATS: &str = "no-stats";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no replicant DB host configured: set replicantDBActiveHost or replicantDBSlavesByDC")]
    MissingReplicantHost,

    #[error("active schema host is not configured")]
    MissingActiveSchemaHost,

    #[error("replicantSchemaName must not be empty")]
    MissingSchemaName,

    #[error("startingBinlogFileName must not be empty")]
    MissingStartingBinlogFile,

    #[error("unknown applier type '{0}'")]
    UnknownApplierType(String),
}

/// Runtime configuration, deserialized from the JSON file the CLI points at.
///
/// Key names follow the operational config format of the original deployment,
/// including its historical `graphiteStatsNamesapce` spelling.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub applier_type: String,

    pub replicant_schema_name: String,
    #[serde(rename = "replicantShardID")]
    pub replicant_shard_id: u32,
    #[serde(rename = "replicantDBSlavesByDC")]
    pub replicant_db_slaves_by_dc: HashMap<String, Vec<String>>,
    #[serde(rename = "replicantDBActiveHost")]
    pub replicant_db_active_host: Option<String>,

    pub starting_binlog_file_name: String,
    pub starting_binlog_position: u64,
    pub ending_binlog_file_name: Option<String>,
    pub initial_snapshot_mode: bool,

    pub write_recent_changes_to_delta_tables: bool,
    pub tables_for_which_to_track_daily_changes: Vec<String>,

    pub active_schema_host: Option<String>,
    pub active_schema_user_name: String,
    pub active_schema_password: String,
    #[serde(rename = "activeSchemaDB")]
    pub active_schema_db: String,

    #[serde(rename = "metaDataDBName")]
    pub meta_data_db_name: Option<String>,
    #[serde(rename = "ZOOKEEPER_QUORUM")]
    pub zookeeper_quorum: Option<String>,

    #[serde(rename = "graphiteStatsNamesapce")]
    pub graphite_stats_namespace: String,
    pub graphite_endpoint: String,

    pub pool_size: usize,
    pub task_row_buffer_limit: usize,
    pub dry_run: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            applier_type: "hbase".to_string(),
            replicant_schema_name: String::new(),
            replicant_shard_id: 0,
            replicant_db_slaves_by_dc: HashMap::new(),
            replicant_db_active_host: None,
            starting_binlog_file_name: String::new(),
            starting_binlog_position: 4,
            ending_binlog_file_name: None,
            initial_snapshot_mode: false,
            write_recent_changes_to_delta_tables: false,
            tables_for_which_to_track_daily_changes: Vec::new(),
            active_schema_host: None,
            active_schema_user_name: String::new(),
            active_schema_password: String::new(),
            active_schema_db: String::new(),
            meta_data_db_name: None,
            zookeeper_quorum: None,
            graphite_stats_namespace: NO_STATS.to_string(),
            graphite_endpoint: "localhost:3002".to_string(),
            pool_size: 4,
            task_row_buffer_limit: 1000,
            dry_run: false,
        }
    }
}

impl Configuration {
    /// Graphite path segment identifying this replicant:
    /// `<schema><shardId>` when sharded, plain `<schema>` otherwise.
    pub fn db_alias(&self) -> String {
        if self.replicant_shard_id > 0 {
            format!("{}{}", self.replicant_schema_name, self.replicant_shard_id)
        } else {
            self.replicant_schema_name.clone()
        }
    }

    pub fn stats_enabled(&self) -> bool {
        self.graphite_stats_namespace != NO_STATS
    }

    pub fn is_delta_tracked(&self, table: &str) -> bool {
        self.write_recent_changes_to_delta_tables
            && self
                .tables_for_which_to_track_daily_changes
                .iter()
                .any(|t| t == table)
    }

    /// The replicant host to read from: the explicitly configured active
    /// host, defaulting to the first slave of the first data center.
    pub fn replicant_active_host(&self) -> Option<String> {
        if let Some(host) = &self.replicant_db_active_host {
            return Some(host.clone());
        }
        let mut dcs: Vec<&String> = self.replicant_db_slaves_by_dc.keys().collect();
        dcs.sort();
        dcs.first()
            .and_then(|dc| self.replicant_db_slaves_by_dc[*dc].first())
            .cloned()
    }

    /// Startup validation; any failure here is fatal before the pipeline
    /// touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicant_schema_name.is_empty() {
            return Err(ConfigError::MissingSchemaName);
        }
        if self.starting_binlog_file_name.is_empty() {
            return Err(ConfigError::MissingStartingBinlogFile);
        }
        if self.replicant_active_host().is_none() {
            return Err(ConfigError::MissingReplicantHost);
        }
        match self.applier_type.as_str() {
            "hbase" if self.active_schema_host.is_none() => {
                Err(ConfigError::MissingActiveSchemaHost)
            }
            "hbase" | "memory" => Ok(()),
            other => Err(ConfigError::UnknownApplierType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operational_key_names() {
        let raw = r#"{
            "applierType": "memory",
            "replicantSchemaName": "shop",
            "replicantShardID": 3,
            "replicantDBSlavesByDC": {"dc1": ["db-1.dc1", "db-2.dc1"]},
            "startingBinlogFileName": "mysql-bin.000001",
            "startingBinlogPosition": 4,
            "writeRecentChangesToDeltaTables": true,
            "tablesForWhichToTrackDailyChanges": ["orders"],
            "activeSchemaHost": "as-1.dc1",
            "activeSchemaUserName": "replicator",
            "activeSchemaPassword": "secret",
            "activeSchemaDB": "shop_active",
            "ZOOKEEPER_QUORUM": "zk-1:2181",
            "graphiteStatsNamesapce": "replication.shop"
        }"#;
        let cfg: Configuration = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.replicant_shard_id, 3);
        assert_eq!(cfg.db_alias(), "shop3");
        assert!(cfg.stats_enabled());
        assert!(cfg.is_delta_tracked("orders"));
        assert!(!cfg.is_delta_tracked("customers"));
        assert_eq!(cfg.replicant_active_host().as_deref(), Some("db-1.dc1"));
        cfg.validate().unwrap();
    }

    #[test]
    fn no_stats_literal_disables_emission() {
        let cfg = Configuration::default();
        assert!(!cfg.stats_enabled());
    }

    #[test]
    fn validation_rejects_missing_hosts() {
        let cfg = Configuration {
            replicant_schema_name: "shop".to_string(),
            starting_binlog_file_name: "mysql-bin.000001".to_string(),
            ..Configuration::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingReplicantHost)
        ));
    }

    #[test]
    fn unsharded_alias_is_the_schema_name() {
        let cfg = Configuration {
            replicant_schema_name: "shop".to_string(),
            ..Configuration::default()
        };
        assert_eq!(cfg.db_alias(), "shop");
    }
}
