//! Metadata queries against a data database: which catalog tables actually
//! exist, and what the persistent role already holds.

use super::{PgExec, quote_literal};
use crate::error::Result;
use crate::types::SourceRef;

/// Relations from all three pg_catalog relation views, as `(schema, name)`.
const RELATIONS_SQL: &str = "SELECT schemaname, tablename FROM pg_catalog.pg_tables
     UNION SELECT schemaname, viewname FROM pg_catalog.pg_views
     UNION SELECT schemaname, matviewname FROM pg_catalog.pg_matviews";

/// Schemas that are never granted or revoked by the reconciler.
fn is_system_schema(schema: &str) -> bool {
    schema == "information_schema"
        || schema == "pg_catalog"
        || schema == "pg_toast"
        || schema.starts_with("pg_temp_")
        || schema.starts_with("pg_toast_temp_")
        || schema.starts_with("_team_")
}

/// Intersection of `candidates` with the relations that exist in the
/// database, preserving candidate order. The principal's own schema and
/// system schemas never qualify.
pub async fn existing_tables(
    exec: &dyn PgExec,
    candidates: &[SourceRef],
    own_schema: &str,
) -> Result<Vec<SourceRef>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let rows = exec.query_text(RELATIONS_SQL).await?;
    let existing: std::collections::HashSet<(String, String)> = rows
        .into_iter()
        .filter_map(|row| match (row.first().cloned(), row.get(1).cloned()) {
            (Some(Some(schema)), Some(Some(table))) => Some((schema, table)),
            _ => None,
        })
        .collect();

    Ok(candidates
        .iter()
        .filter(|c| {
            !is_system_schema(&c.schema)
                && c.schema != own_schema
                && existing.contains(&(c.schema.clone(), c.table.clone()))
        })
        .cloned()
        .collect())
}

/// Every `(schema, name)` the role holds any table privilege on, excluding
/// system schemas, the role's own schema, and time-suffixed rollover tables.
pub async fn tables_with_privileges(
    exec: &dyn PgExec,
    role: &str,
) -> Result<Vec<(String, String)>> {
    let sql = format!(
        "SELECT schemaname, tablename FROM ({RELATIONS_SQL}) rels
         WHERE has_table_privilege(
             {role}, quote_ident(schemaname) || '.' || quote_ident(tablename),
             'SELECT, INSERT, UPDATE, DELETE, TRUNCATE, REFERENCES, TRIGGER')
         ORDER BY schemaname, tablename",
        role = quote_literal(role),
    );

    let rows = exec.query_text(&sql).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match (row.first().cloned(), row.get(1).cloned()) {
            (Some(Some(schema)), Some(Some(table))) => Some((schema, table)),
            _ => None,
        })
        .filter(|(schema, table)| {
            !is_system_schema(schema) && schema != role && !is_rollover_name(table)
        })
        .collect())
}

/// Every schema the role holds CREATE or USAGE on, with the same exclusions.
pub async fn schemas_with_privileges(exec: &dyn PgExec, role: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT nspname FROM pg_catalog.pg_namespace
         WHERE has_schema_privilege({role}, nspname, 'CREATE, USAGE')
         ORDER BY nspname",
        role = quote_literal(role),
    );

    let rows = exec.query_text(&sql).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .filter(|schema| !is_system_schema(schema) && schema != role)
        .collect())
}

/// Managed roles the admin user is not yet a member of. Membership is needed
/// before `SET ROLE` and `GRANT <role> TO ...` are legal on RDS.
pub async fn missing_membership_roles(exec: &dyn PgExec, admin_user: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT r.rolname FROM pg_catalog.pg_roles r
         WHERE (r.rolname ~ '^_user_[0-9a-f]{{8}}$'
                OR r.rolname ~ '^_user_app_'
                OR r.rolname ~ '^_team_')
           AND NOT EXISTS (
               SELECT 1 FROM pg_catalog.pg_auth_members m
               JOIN pg_catalog.pg_roles member ON member.oid = m.member
               WHERE m.roleid = r.oid AND member.rolname = {admin}
           )
         ORDER BY r.rolname",
        admin = quote_literal(admin_user),
    );

    let rows = exec.query_text(&sql).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}

/// Team roles the given role is already a member of.
pub async fn member_team_roles(exec: &dyn PgExec, role: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT r.rolname FROM pg_catalog.pg_roles r
         JOIN pg_catalog.pg_auth_members m ON m.roleid = r.oid
         JOIN pg_catalog.pg_roles member ON member.oid = m.member
         WHERE member.rolname = {role} AND r.rolname ~ '^_team_'
         ORDER BY r.rolname",
        role = quote_literal(role),
    );

    let rows = exec.query_text(&sql).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}

/// Matches the `_YYYYMMDDtHHMMSS` suffix left behind by table rollovers.
fn is_rollover_name(table: &str) -> bool {
    let bytes = table.as_bytes();
    if bytes.len() < 16 {
        return false;
    }
    let suffix = &bytes[bytes.len() - 16..];
    suffix[0] == b'_'
        && suffix[1..9].iter().all(u8::is_ascii_digit)
        && suffix[9] == b't'
        && suffix[10..16].iter().all(u8::is_ascii_digit)
}
