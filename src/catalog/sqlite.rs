use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store; used by fixtures and tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in catalog: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_domains(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::error!("Invalid email-domain list in catalog: '{}' - {}", raw, e);
        Vec::new()
    })
}

fn principal_from_row(row: &Row<'_>) -> rusqlite::Result<PrincipalRecord> {
    Ok(PrincipalRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        privileged: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    let dataset_type: String = row.get(2)?;
    let access: String = row.get(5)?;
    let domains: String = row.get(6)?;
    Ok(Dataset {
        id: row.get(0)?,
        name: row.get(1)?,
        dataset_type: DatasetType::from_str(&dataset_type).unwrap_or(DatasetType::Master),
        published: row.get(3)?,
        deleted: row.get(4)?,
        access: AccessMode::from_str(&access).unwrap_or(AccessMode::RequiresAuthorization),
        authorized_email_domains: parse_domains(&domains),
        external_database: row.get(7)?,
        reference_table_name: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

const DATASET_COLUMNS: &str = "id, name, dataset_type, published, deleted, access, \
     authorized_email_domains, external_database, reference_table_name, created_at";

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Principal operations

    fn create_principal(&self, principal: &PrincipalRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO principals (id, external_id, email, privileged, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                principal.id,
                principal.external_id,
                principal.email,
                principal.privileged,
                format_datetime(&principal.created_at),
                format_datetime(&principal.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_principal(&self, id: &str) -> Result<Option<PrincipalRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, external_id, email, privileged, created_at, updated_at
             FROM principals WHERE id = ?1",
            params![id],
            principal_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_principal_by_external_id(&self, external_id: &str) -> Result<Option<PrincipalRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, external_id, email, privileged, created_at, updated_at
             FROM principals WHERE external_id = ?1",
            params![external_id],
            principal_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_principals(&self) -> Result<Vec<PrincipalRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, external_id, email, privileged, created_at, updated_at
             FROM principals ORDER BY id",
        )?;
        let rows = stmt.query_map([], principal_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Dataset operations

    fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.conn().execute(
            "INSERT INTO datasets (id, name, dataset_type, published, deleted, access,
                 authorized_email_domains, external_database, reference_table_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                dataset.id,
                dataset.name,
                dataset.dataset_type.as_str(),
                dataset.published,
                dataset.deleted,
                dataset.access.as_str(),
                serde_json::to_string(&dataset.authorized_email_domains)
                    .map_err(|e| Error::BadRequest(e.to_string()))?,
                dataset.external_database,
                dataset.reference_table_name,
                format_datetime(&dataset.created_at),
            ],
        )?;
        Ok(())
    }

    fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE datasets SET name = ?1, dataset_type = ?2, published = ?3, deleted = ?4,
                 access = ?5, authorized_email_domains = ?6, external_database = ?7,
                 reference_table_name = ?8
             WHERE id = ?9",
            params![
                dataset.name,
                dataset.dataset_type.as_str(),
                dataset.published,
                dataset.deleted,
                dataset.access.as_str(),
                serde_json::to_string(&dataset.authorized_email_domains)
                    .map_err(|e| Error::BadRequest(e.to_string()))?,
                dataset.external_database,
                dataset.reference_table_name,
                dataset.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = ?1"),
            params![id],
            dataset_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_live_datasets(&self) -> Result<Vec<Dataset>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DATASET_COLUMNS} FROM datasets WHERE deleted = 0 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], dataset_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn create_source_table(&self, table: &SourceTable) -> Result<()> {
        validate_pg_name(&table.schema, "schema")?;
        validate_pg_name(&table.table, "table")?;
        self.conn().execute(
            "INSERT INTO source_tables (id, dataset_id, database, schema, tbl)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                table.id,
                table.dataset_id,
                table.database,
                table.schema,
                table.table
            ],
        )?;
        Ok(())
    }

    fn list_dataset_tables(&self, dataset_id: &str) -> Result<Vec<SourceTable>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, dataset_id, database, schema, tbl FROM source_tables
             WHERE dataset_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![dataset_id], |row| {
            Ok(SourceTable {
                id: row.get(0)?,
                dataset_id: row.get(1)?,
                database: row.get(2)?,
                schema: row.get(3)?,
                table: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Permission operations

    fn grant_dataset_to_principal(&self, principal_id: &str, dataset_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO dataset_user_permissions (principal_id, dataset_id)
             VALUES (?1, ?2)",
            params![principal_id, dataset_id],
        )?;
        Ok(())
    }

    fn revoke_dataset_from_principal(&self, principal_id: &str, dataset_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM dataset_user_permissions WHERE principal_id = ?1 AND dataset_id = ?2",
            params![principal_id, dataset_id],
        )?;
        Ok(rows > 0)
    }

    fn has_principal_permission(&self, principal_id: &str, dataset_id: &str) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dataset_user_permissions
             WHERE principal_id = ?1 AND dataset_id = ?2",
            params![principal_id, dataset_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn grant_dataset_to_application(&self, template: &str, dataset_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO application_template_permissions (application_template, dataset_id)
             VALUES (?1, ?2)",
            params![template, dataset_id],
        )?;
        Ok(())
    }

    fn has_application_permission(&self, template: &str, dataset_id: &str) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM application_template_permissions
             WHERE application_template = ?1 AND dataset_id = ?2",
            params![template, dataset_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Team operations

    fn create_team(&self, team: &Team) -> Result<()> {
        self.conn().execute(
            "INSERT INTO teams (id, name, slug, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                team.id,
                team.name,
                team.slug,
                format_datetime(&team.created_at)
            ],
        )?;
        Ok(())
    }

    fn add_team_member(&self, team_id: &str, principal_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO team_memberships (team_id, principal_id) VALUES (?1, ?2)",
            params![team_id, principal_id],
        )?;
        Ok(())
    }

    fn remove_team_member(&self, team_id: &str, principal_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM team_memberships WHERE team_id = ?1 AND principal_id = ?2",
            params![team_id, principal_id],
        )?;
        Ok(rows > 0)
    }

    fn principal_teams(&self, principal_id: &str) -> Result<Vec<Team>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, t.slug, t.created_at
             FROM teams t JOIN team_memberships m ON m.team_id = t.id
             WHERE m.principal_id = ?1 ORDER BY t.slug",
        )?;
        let rows = stmt.query_map(params![principal_id], |row| {
            Ok(Team {
                id: row.get(0)?,
                name: row.get(1)?,
                slug: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Issued login users

    fn record_database_user(&self, user: &DatabaseUser) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO database_users (principal_id, database, ephemeral_user, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.principal_id,
                user.database,
                user.ephemeral_user,
                format_datetime(&user.created_at),
            ],
        )?;
        Ok(())
    }

    fn find_principal_for_login(
        &self,
        database: &str,
        ephemeral_user: &str,
    ) -> Result<Option<PrincipalRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT p.id, p.external_id, p.email, p.privileged, p.created_at, p.updated_at
             FROM principals p
             JOIN database_users u ON u.principal_id = p.id
             WHERE u.database = ?1 AND u.ephemeral_user = ?2",
            params![database, ephemeral_user],
            principal_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    // Audit log ingestion

    fn insert_audit_row(&self, row: &QueryAuditRow) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO query_audit_logs
                 (database, occurred_at, rolname, session_line, principal_email, sql, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.database,
                format_datetime(&row.occurred_at),
                row.rolname,
                row.session_line,
                row.principal_email,
                row.sql,
                row.kind,
            ],
        )?;
        Ok(rows > 0)
    }

    fn audit_cursor(&self, database: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(occurred_at) FROM query_audit_logs WHERE database = ?1",
            params![database],
            |row| row.get(0),
        )?;
        Ok(latest.map(|s| parse_datetime(&s)))
    }

    fn list_audit_rows(&self, database: &str, limit: i64) -> Result<Vec<QueryAuditRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT database, occurred_at, rolname, session_line, principal_email, sql, kind
             FROM query_audit_logs WHERE database = ?1
             ORDER BY occurred_at, session_line LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![database, limit], |row| {
            Ok(QueryAuditRow {
                database: row.get(0)?,
                occurred_at: parse_datetime(&row.get::<_, String>(1)?),
                rolname: row.get(2)?,
                session_line: row.get(3)?,
                principal_email: row.get(4)?,
                sql: row.get(5)?,
                kind: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Lease-based lock primitives

    fn try_acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let conn = self.conn();
        let now = format_datetime(&Utc::now());
        let expires_at = format_datetime(
            &(Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero())),
        );

        // Expired leases are fenced out before the insert attempt.
        conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND expires_at < ?2",
            params![key, now],
        )?;

        let rows = conn.execute(
            "INSERT OR IGNORE INTO locks (key, holder, expires_at) VALUES (?1, ?2, ?3)",
            params![key, holder, expires_at],
        )?;
        Ok(rows > 0)
    }

    fn release_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM locks WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(rows > 0)
    }

    // Process-coordination values

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // Token operations

    fn create_token(&self, token: &Token) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tokens (id, token_hash, token_lookup, is_admin, principal_id,
                 created_at, expires_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.is_admin,
                token.principal_id,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
                token.last_used_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, token_hash, token_lookup, is_admin, principal_id,
                    created_at, expires_at, last_used_at
             FROM tokens WHERE token_lookup = ?1",
            params![lookup],
            |row| {
                Ok(Token {
                    id: row.get(0)?,
                    token_hash: row.get(1)?,
                    token_lookup: row.get(2)?,
                    is_admin: row.get(3)?,
                    principal_id: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                    expires_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
                    last_used_at: row.get::<_, Option<String>>(7)?.map(|s| parse_datetime(&s)),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn update_token_last_used(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn has_admin_token(&self) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tokens WHERE is_admin = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
