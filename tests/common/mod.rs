//! Shared fixtures: an in-memory catalog with one principal and dataset, and
//! a scripted Postgres connection that records every executed statement.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use datagate::catalog::{SqliteStore, Store};
use datagate::config::{DatabaseConfig, Settings};
use datagate::error::Result;
use datagate::pg::{PgConnector, PgExec};
use datagate::types::{AccessMode, Dataset, DatasetType, PrincipalRecord, SourceTable};

/// A scripted admin connection. Statements are recorded; introspection
/// queries answer from the mutable state below, so a test can advance the
/// "database" between reconciler calls.
#[derive(Clone, Default)]
pub struct RecordingExec {
    pub executed: Arc<Mutex<Vec<String>>>,
    /// `(schema, table)` relations that exist in the database.
    pub existing_tables: Arc<Mutex<Vec<(String, String)>>>,
    /// `(schema, table)` the persistent role holds privileges on.
    pub held_tables: Arc<Mutex<Vec<(String, String)>>>,
    /// Schemas the persistent role holds privileges on.
    pub held_schemas: Arc<Mutex<Vec<String>>>,
    /// Team roles the persistent role is a member of.
    pub held_teams: Arc<Mutex<Vec<String>>>,
    /// Managed roles the admin user is not yet a member of.
    pub missing_roles: Arc<Mutex<Vec<String>>>,
}

impl RecordingExec {
    pub fn statements(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn statements_containing(&self, needle: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(needle))
            .collect()
    }
}

fn pair_rows(pairs: &[(String, String)]) -> Vec<Vec<Option<String>>> {
    pairs
        .iter()
        .map(|(a, b)| vec![Some(a.clone()), Some(b.clone())])
        .collect()
}

fn single_rows(values: &[String]) -> Vec<Vec<Option<String>>> {
    values.iter().map(|v| vec![Some(v.clone())]).collect()
}

#[async_trait]
impl PgExec for RecordingExec {
    async fn exec(&self, sql: &str) -> Result<u64> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(0)
    }

    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        if sql.contains("pg_auth_members") {
            if sql.contains("NOT EXISTS") {
                return Ok(single_rows(&self.missing_roles.lock().unwrap()));
            }
            return Ok(single_rows(&self.held_teams.lock().unwrap()));
        }
        if sql.contains("has_table_privilege") {
            return Ok(pair_rows(&self.held_tables.lock().unwrap()));
        }
        if sql.contains("has_schema_privilege") {
            return Ok(single_rows(&self.held_schemas.lock().unwrap()));
        }
        if sql.contains("pg_catalog.pg_tables") {
            return Ok(pair_rows(&self.existing_tables.lock().unwrap()));
        }
        Ok(Vec::new())
    }
}

/// Hands the same recording connection to every connect call.
pub struct FakeConnector {
    pub exec: RecordingExec,
    /// Memorable names whose connection attempts fail.
    pub failing: Vec<String>,
}

impl FakeConnector {
    pub fn new(exec: RecordingExec) -> Self {
        Self {
            exec,
            failing: Vec::new(),
        }
    }
}

#[async_trait]
impl PgConnector for FakeConnector {
    async fn connect(&self, db: &DatabaseConfig, _options: &str) -> Result<Box<dyn PgExec>> {
        if self.failing.contains(&db.memorable_name) {
            return Err(datagate::error::Error::Config(format!(
                "connection to '{}' refused",
                db.memorable_name
            )));
        }
        Ok(Box::new(self.exec.clone()))
    }
}

pub fn settings() -> Arc<Settings> {
    Arc::new(
        Settings::parse(
            r#"
            [databases.main]
            host = "pg.internal"
            dbname = "warehouse"
            user = "dg_admin"
            password = "secret"

            [databases.reporting]
            host = "pg2.internal"
            dbname = "reporting"
            user = "dg_admin"
            password = "secret"
            "#,
        )
        .unwrap(),
    )
}

pub fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().unwrap();
    store.initialize().unwrap();
    Arc::new(store)
}

pub fn principal(store: &SqliteStore, external_id: &str, email: &str) -> PrincipalRecord {
    let now = Utc::now();
    let principal = PrincipalRecord {
        id: Uuid::new_v4().to_string(),
        external_id: external_id.to_string(),
        email: email.to_string(),
        privileged: false,
        created_at: now,
        updated_at: now,
    };
    store.create_principal(&principal).unwrap();
    principal
}

/// A published master dataset with one source table, readable by any
/// authenticated principal.
pub fn dataset_with_table(
    store: &SqliteStore,
    name: &str,
    database: &str,
    schema: &str,
    table: &str,
) -> Dataset {
    let dataset = Dataset {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        dataset_type: DatasetType::Master,
        published: true,
        deleted: false,
        access: AccessMode::RequiresAuthentication,
        authorized_email_domains: Vec::new(),
        external_database: None,
        reference_table_name: None,
        created_at: Utc::now(),
    };
    store.create_dataset(&dataset).unwrap();
    store
        .create_source_table(&SourceTable {
            id: Uuid::new_v4().to_string(),
            dataset_id: dataset.id.clone(),
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        })
        .unwrap();
    dataset
}
