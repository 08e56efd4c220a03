use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// DSN components of one target data database, keyed in the settings file by
/// its memorable name.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Memorable name: the routing key across the whole system. Filled from
    /// the settings map key.
    #[serde(default)]
    pub memorable_name: String,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

fn default_pg_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Memorable name -> DSN components.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,

    /// Databases a principal always gets a login to, even with no tables.
    #[serde(default)]
    pub force_databases: Vec<String>,

    /// Passed verbatim to `pgaudit.log` on every role the reconciler manages.
    #[serde(default = "default_pgaudit_scopes")]
    pub pgaudit_log_scopes: String,

    /// Object-storage bucket for published credentials; unset disables the
    /// publisher.
    #[serde(default)]
    pub notebooks_bucket: Option<String>,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_idle_in_txn_timeout_ms")]
    pub idle_in_txn_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_credential_valid_for_secs")]
    pub credential_valid_for_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_pgaudit_scopes() -> String {
    "ALL, -MISC".to_string()
}

fn default_query_timeout_ms() -> u64 {
    300_000
}

fn default_idle_in_txn_timeout_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    1_000
}

fn default_credential_valid_for_secs() -> u64 {
    86_400
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;

        for (name, db) in &mut settings.databases {
            db.memorable_name = name.clone();
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::Config(format!(
                    "memorable name '{name}' may only contain [A-Za-z0-9_]"
                )));
            }
        }

        for forced in &settings.force_databases {
            if !settings.databases.contains_key(forced) {
                return Err(Error::Config(format!(
                    "force_databases entry '{forced}' is not a configured database"
                )));
            }
        }

        Ok(settings)
    }

    pub fn database(&self, memorable_name: &str) -> Result<&DatabaseConfig> {
        self.databases
            .get(memorable_name)
            .ok_or_else(|| Error::UnknownDatabase(memorable_name.to_string()))
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("datagate.db")
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    #[must_use]
    pub fn credential_valid_for(&self) -> Duration {
        Duration::from_secs(self.credential_valid_for_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::parse("").expect("empty settings parse")
    }
}
