//! Query audit-log ingestion.
//!
//! Pulls pgaudit session rows out of each data database into the catalog
//! store, resolving the Postgres login name back to the principal the
//! reconciler issued it to. Each run is idempotent: the dedup key is
//! `(database, timestamp, rolname, session_line)`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::catalog::Store;
use crate::config::{DatabaseConfig, Settings};
use crate::error::{Error, Result};
use crate::pg::{PgConnector, quote_literal};
use crate::types::QueryAuditRow;

/// Process-coordination key carrying the last run time across workers.
pub const LAST_RUN_KEY: &str = "query_tool_logs_last_run";

/// Minimum interval between runs, enforced across all workers.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

pub struct AuditSync {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    connector: Arc<dyn PgConnector>,
}

impl AuditSync {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        connector: Arc<dyn PgConnector>,
    ) -> Self {
        Self {
            settings,
            store,
            connector,
        }
    }

    /// One ingestion pass over all configured databases, honoring the
    /// shared minimum interval. Returns the number of rows inserted; zero
    /// when the interval floor suppressed the run.
    pub async fn run(&self) -> Result<u64> {
        let now = Utc::now();
        if let Some(raw) = self.store.get_meta(LAST_RUN_KEY)? {
            if let Ok(last_run) = DateTime::parse_from_rfc3339(&raw) {
                let elapsed = now.signed_duration_since(last_run.with_timezone(&Utc));
                if elapsed < chrono::Duration::from_std(MIN_INTERVAL).unwrap_or_default() {
                    debug!("audit sync ran {}s ago; skipping", elapsed.num_seconds());
                    return Ok(0);
                }
            }
        }
        self.store.put_meta(LAST_RUN_KEY, &now.to_rfc3339())?;

        let mut inserted = 0;
        for db in self.settings.databases.values() {
            // A failing database never blocks the others; it catches up on
            // the next run from its own cursor.
            match self.sync_database(db).await {
                Ok(n) => inserted += n,
                Err(e) => warn!("audit sync for '{}' failed: {e}", db.memorable_name),
            }
        }
        info!(rows = inserted, "audit sync finished");
        Ok(inserted)
    }

    async fn sync_database(&self, db: &DatabaseConfig) -> Result<u64> {
        let cursor = self.store.audit_cursor(&db.memorable_name)?;
        let exec = self.connector.connect(db, "").await?;

        let rows = exec.query_text(&fetch_sql(cursor)).await?;
        let mut inserted = 0;
        for row in rows {
            let parsed = match parse_audit_row(&db.memorable_name, &row) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("malformed audit row from '{}': {e}", db.memorable_name);
                    continue;
                }
            };

            let principal = self
                .store
                .find_principal_for_login(&db.memorable_name, &parsed.rolname)?;
            let Some(principal) = principal else {
                // Not one of ours (superusers, other services); skip.
                debug!(
                    "{}",
                    Error::AuditGap(format!(
                        "no principal for login '{}' on '{}'",
                        parsed.rolname, db.memorable_name
                    ))
                );
                continue;
            };

            let record = QueryAuditRow {
                principal_email: Some(principal.email),
                ..parsed
            };
            if self.store.insert_audit_row(&record)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// The ingestion query against the pgaudit log table, from the cursor
/// forward. Timestamps come back in RFC 3339 so parsing is unambiguous.
fn fetch_sql(cursor: Option<DateTime<Utc>>) -> String {
    let mut sql = String::from(
        "SELECT to_char(log_time AT TIME ZONE 'UTC', \
         'YYYY-MM-DD\"T\"HH24:MI:SS.US\"+00:00\"'), \
         session_line_num::text, rolname, class, statement \
         FROM public.pgaudit_log",
    );
    if let Some(cursor) = cursor {
        sql.push_str(&format!(
            " WHERE log_time > {}",
            quote_literal(&cursor.to_rfc3339())
        ));
    }
    sql.push_str(" ORDER BY log_time, session_line_num");
    sql
}

fn parse_audit_row(database: &str, row: &[Option<String>]) -> Result<QueryAuditRow> {
    let field = |i: usize| -> Result<String> {
        row.get(i)
            .cloned()
            .flatten()
            .ok_or_else(|| Error::InvalidArgument(format!("audit column {i} missing")))
    };

    let occurred_at = DateTime::parse_from_rfc3339(&field(0)?)
        .map_err(|e| Error::InvalidArgument(format!("bad audit timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(QueryAuditRow {
        database: database.to_string(),
        occurred_at,
        rolname: field(2)?,
        session_line: field(1)?,
        principal_email: None,
        sql: field(4)?,
        kind: field(3)?,
    })
}
