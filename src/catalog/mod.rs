pub mod projection;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Store defines the catalog database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Principal operations
    fn create_principal(&self, principal: &PrincipalRecord) -> Result<()>;
    fn get_principal(&self, id: &str) -> Result<Option<PrincipalRecord>>;
    fn get_principal_by_external_id(&self, external_id: &str) -> Result<Option<PrincipalRecord>>;
    fn list_principals(&self) -> Result<Vec<PrincipalRecord>>;

    // Dataset operations
    fn create_dataset(&self, dataset: &Dataset) -> Result<()>;
    fn update_dataset(&self, dataset: &Dataset) -> Result<()>;
    fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;
    /// All datasets with deleted = false, in stable catalog order.
    fn list_live_datasets(&self) -> Result<Vec<Dataset>>;
    fn create_source_table(&self, table: &SourceTable) -> Result<()>;
    fn list_dataset_tables(&self, dataset_id: &str) -> Result<Vec<SourceTable>>;

    // Permission operations
    fn grant_dataset_to_principal(&self, principal_id: &str, dataset_id: &str) -> Result<()>;
    fn revoke_dataset_from_principal(&self, principal_id: &str, dataset_id: &str) -> Result<bool>;
    fn has_principal_permission(&self, principal_id: &str, dataset_id: &str) -> Result<bool>;
    fn grant_dataset_to_application(&self, template: &str, dataset_id: &str) -> Result<()>;
    fn has_application_permission(&self, template: &str, dataset_id: &str) -> Result<bool>;

    // Team operations
    fn create_team(&self, team: &Team) -> Result<()>;
    fn add_team_member(&self, team_id: &str, principal_id: &str) -> Result<()>;
    fn remove_team_member(&self, team_id: &str, principal_id: &str) -> Result<bool>;
    fn principal_teams(&self, principal_id: &str) -> Result<Vec<Team>>;

    // Issued login users
    fn record_database_user(&self, user: &DatabaseUser) -> Result<()>;
    fn find_principal_for_login(
        &self,
        database: &str,
        ephemeral_user: &str,
    ) -> Result<Option<PrincipalRecord>>;

    // Audit log ingestion
    /// Idempotent insert; returns false when the dedup key already exists.
    fn insert_audit_row(&self, row: &QueryAuditRow) -> Result<bool>;
    /// Timestamp of the newest ingested row for a database, if any.
    fn audit_cursor(&self, database: &str) -> Result<Option<DateTime<Utc>>>;
    fn list_audit_rows(&self, database: &str, limit: i64) -> Result<Vec<QueryAuditRow>>;

    // Lease-based lock primitives (see crate::lock)
    fn try_acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<bool>;
    fn release_lock(&self, key: &str, holder: &str) -> Result<bool>;

    // Process-coordination values
    fn get_meta(&self, key: &str) -> Result<Option<String>>;
    fn put_meta(&self, key: &str, value: &str) -> Result<()>;

    // Token operations
    fn create_token(&self, token: &Token) -> Result<()>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>>;
    fn update_token_last_used(&self, id: &str) -> Result<()>;
    fn has_admin_token(&self) -> Result<bool>;
}
