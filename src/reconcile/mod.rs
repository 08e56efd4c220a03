//! The reconciler: converges each target database's roles and grants towards
//! catalog truth, then issues a short-lived login user bound to the
//! principal's persistent role.
//!
//! All grant/revoke mutations run under the cluster-wide `database-grant-v1`
//! lock; a failure in one database aborts that database only and the caller
//! receives whatever credentials were issued before it.

pub mod deltas;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::{Store, projection};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::identity;
use crate::lock::{APPLY_LEASE, BLOCKING_TIMEOUT, GRANT_LOCK_KEY, LockProvider, MEMBERSHIP_LEASE};
use crate::pg::{PgConnector, PgExec, introspect, quote_ident, quote_literal, quote_qualified};
use crate::types::{Credentials, DatabaseUser, PrincipalRecord, SourceRef};

/// Result of one issuance call: credentials for every database that
/// succeeded, and the error for every database that did not.
#[derive(Debug, Default)]
pub struct IssueOutcome {
    pub credentials: Vec<Credentials>,
    pub failures: Vec<(String, Error)>,
}

pub struct Reconciler {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    lock: Arc<dyn LockProvider>,
    connector: Arc<dyn PgConnector>,
}

impl Reconciler {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        lock: Arc<dyn LockProvider>,
        connector: Arc<dyn PgConnector>,
    ) -> Self {
        Self {
            settings,
            store,
            lock,
            connector,
        }
    }

    /// Issues credentials for every database `allowed` touches, plus every
    /// database in `force_databases` (with an empty table list if need be).
    ///
    /// One ephemeral login name and password is shared across databases; the
    /// persistent role is always derived from the principal's external id.
    pub async fn issue_credentials(
        &self,
        principal: &PrincipalRecord,
        allowed: &[SourceRef],
        ephemeral_user: &str,
        valid_for: Duration,
        force_databases: &[String],
    ) -> Result<IssueOutcome> {
        let groups = group_by_database(allowed, force_databases);
        if groups.is_empty() {
            return Err(Error::NotAuthorized(format!(
                "no readable tables for {}",
                principal.email
            )));
        }

        let password = identity::generate_password();
        let team_roles = projection::team_schemas(self.store.as_ref(), &principal.id)?;

        let mut outcome = IssueOutcome::default();
        for (database, tuples) in groups {
            match self
                .reconcile_database(principal, &database, &tuples, &team_roles, ephemeral_user, &password, valid_for)
                .await
            {
                Ok(credentials) => {
                    self.store.record_database_user(&DatabaseUser {
                        principal_id: principal.id.clone(),
                        database: database.clone(),
                        ephemeral_user: ephemeral_user.to_string(),
                        created_at: Utc::now(),
                    })?;
                    outcome.credentials.push(credentials);
                }
                Err(e) => {
                    warn!(
                        principal_email = %principal.email,
                        database = %database,
                        error = %e,
                        "credential issuance failed"
                    );
                    outcome.failures.push((database, e));
                }
            }
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_database(
        &self,
        principal: &PrincipalRecord,
        database: &str,
        tuples: &[SourceRef],
        team_roles: &[String],
        ephemeral_user: &str,
        password: &str,
        valid_for: Duration,
    ) -> Result<Credentials> {
        let start = std::time::Instant::now();
        let cfg = self.settings.database(database)?.clone();
        let role = identity::persistent_role(&principal.external_id);

        info!(
            principal_email = %principal.email,
            database = %database,
            "reconciling database access"
        );

        let exec = self.connector.connect(&cfg, "").await?;

        // Step 1: the admin must be a member of every managed role before it
        // can GRANT them or SET ROLE to them.
        self.prepare_admin_membership(exec.as_ref(), &cfg.user).await?;

        // Step 2: compute deltas against what actually exists and is held.
        let allowed_existing =
            introspect::existing_tables(exec.as_ref(), tuples, &role).await?;
        let held_tables = introspect::tables_with_privileges(exec.as_ref(), &role).await?;
        let held_schemas = introspect::schemas_with_privileges(exec.as_ref(), &role).await?;
        let held_teams = introspect::member_team_roles(exec.as_ref(), &role).await?;

        let allowed_pairs: Vec<(String, String)> = allowed_existing
            .iter()
            .map(|r| (r.schema.clone(), r.table.clone()))
            .collect();
        let allowed_schemas = distinct_schemas(&allowed_pairs);

        let deltas = deltas::compute(
            &allowed_pairs,
            &held_tables,
            &allowed_schemas,
            &held_schemas,
            team_roles,
            &held_teams,
        );

        // Step 3: persistent role and schema, for the principal and teams.
        self.ensure_role_and_schema(exec.as_ref(), &role).await?;
        for team in team_roles {
            self.ensure_role_and_schema(exec.as_ref(), team).await?;
        }

        // Step 4: the ephemeral login user, then session defaults on every
        // role a session might run as.
        let valid_until = Utc::now()
            + chrono::Duration::from_std(valid_for)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        exec.exec(&format!(
            "CREATE USER {} WITH PASSWORD {} VALID UNTIL {}",
            quote_ident(ephemeral_user),
            quote_literal(password),
            quote_literal(&valid_until.to_rfc3339()),
        ))
        .await?;

        self.apply_role_defaults(exec.as_ref(), ephemeral_user).await?;
        self.apply_role_defaults(exec.as_ref(), &role).await?;
        for team in team_roles {
            self.apply_role_defaults(exec.as_ref(), team).await?;
        }

        // Step 5: grants and revokes, serialised by the cluster-wide lock.
        let lease = self
            .lock
            .acquire(GRANT_LOCK_KEY, BLOCKING_TIMEOUT, APPLY_LEASE)
            .await?;
        let applied = self
            .apply_deltas(exec.as_ref(), &deltas, &cfg.dbname, &role, ephemeral_user)
            .await;
        // A failed release only delays the next acquirer until the lease
        // expires; it must not mask the apply outcome.
        if let Err(release_err) = self.lock.release(&lease).await {
            warn!(database = %database, "lock release failed: {release_err}");
        }
        applied?;

        // Step 6: sessions of the login user own objects as the persistent
        // role. Not atomic with step 5h; callers must not rely on the default
        // role until this call returns.
        exec.exec(&format!(
            "ALTER USER {} SET ROLE {}",
            quote_ident(ephemeral_user),
            quote_ident(&role),
        ))
        .await?;

        info!(
            principal_email = %principal.email,
            database = %database,
            duration_ms = start.elapsed().as_millis() as u64,
            granted = deltas.tables_to_grant.len(),
            revoked = deltas.tables_to_revoke.len(),
            "database access reconciled"
        );

        Ok(Credentials {
            memorable_name: cfg.memorable_name.clone(),
            db_name: cfg.dbname.clone(),
            db_host: cfg.host.clone(),
            db_port: cfg.port,
            db_user: ephemeral_user.to_string(),
            db_persistent_role: role,
            db_password: Some(password.to_string()),
        })
    }

    async fn prepare_admin_membership(&self, exec: &dyn PgExec, admin_user: &str) -> Result<()> {
        let missing = introspect::missing_membership_roles(exec, admin_user).await?;
        if missing.is_empty() {
            return Ok(());
        }

        let lease = self
            .lock
            .acquire(GRANT_LOCK_KEY, BLOCKING_TIMEOUT, MEMBERSHIP_LEASE)
            .await?;
        let granted = async {
            for role in &missing {
                exec.exec(&format!(
                    "GRANT {} TO {}",
                    quote_ident(role),
                    quote_ident(admin_user),
                ))
                .await?;
            }
            Ok(())
        }
        .await;
        if let Err(release_err) = self.lock.release(&lease).await {
            warn!("lock release failed: {release_err}");
        }
        granted
    }

    /// Idempotent role + schema creation. The nested block absorbs the race
    /// with a concurrent CREATE ROLE of the same name.
    async fn ensure_role_and_schema(&self, exec: &dyn PgExec, role: &str) -> Result<()> {
        debug!(role = %role, "ensuring persistent role and schema");
        exec.exec(&format!(
            "DO $$ BEGIN CREATE ROLE {}; EXCEPTION WHEN duplicate_object THEN \
             RAISE DEBUG 'role already exists'; END $$",
            quote_ident(role),
        ))
        .await?;
        exec.exec(&format!(
            "CREATE SCHEMA IF NOT EXISTS {role} AUTHORIZATION {role}",
            role = quote_ident(role),
        ))
        .await?;
        Ok(())
    }

    async fn apply_role_defaults(&self, exec: &dyn PgExec, role: &str) -> Result<()> {
        let role = quote_ident(role);
        exec.exec(&format!(
            "ALTER ROLE {role} SET idle_in_transaction_session_timeout = '60min'"
        ))
        .await?;
        exec.exec(&format!("ALTER ROLE {role} SET statement_timeout = '60min'"))
            .await?;
        exec.exec(&format!(
            "ALTER ROLE {role} SET pgaudit.log = {}",
            quote_literal(&self.settings.pgaudit_log_scopes),
        ))
        .await?;
        exec.exec(&format!("ALTER ROLE {role} SET pgaudit.log_catalog = off"))
            .await?;
        exec.exec(&format!("ALTER ROLE {role} WITH CONNECTION LIMIT 10"))
            .await?;
        Ok(())
    }

    /// The locked apply step. Statement order matters: revokes strictly
    /// before grants so no transient state widens access.
    async fn apply_deltas(
        &self,
        exec: &dyn PgExec,
        deltas: &deltas::Deltas,
        dbname: &str,
        role: &str,
        ephemeral_user: &str,
    ) -> Result<()> {
        let quoted_role = quote_ident(role);

        if !deltas.schemas_to_revoke.is_empty() {
            exec.exec(&format!(
                "REVOKE ALL PRIVILEGES ON SCHEMA {} FROM {quoted_role}",
                join_idents(&deltas.schemas_to_revoke),
            ))
            .await?;
        }

        if !deltas.tables_to_revoke.is_empty() {
            exec.exec(&format!(
                "REVOKE ALL PRIVILEGES ON {} FROM {quoted_role}",
                join_tables(&deltas.tables_to_revoke),
            ))
            .await?;
        }

        if !deltas.schemas_to_grant.is_empty() {
            exec.exec(&format!(
                "GRANT USAGE ON SCHEMA {} TO {quoted_role}",
                join_idents(&deltas.schemas_to_grant),
            ))
            .await?;
        }

        if !deltas.tables_to_grant.is_empty() {
            exec.exec(&format!(
                "GRANT SELECT ON {} TO {quoted_role}",
                join_tables(&deltas.tables_to_grant),
            ))
            .await?;
        }

        for team in &deltas.team_roles_to_revoke {
            exec.exec(&format!(
                "REVOKE {} FROM {quoted_role}",
                quote_ident(team),
            ))
            .await?;
            exec.exec(&format!(
                "ALTER DEFAULT PRIVILEGES FOR USER {quoted_role} IN SCHEMA {team} \
                 REVOKE ALL ON TABLES FROM {team}",
                team = quote_ident(team),
            ))
            .await?;
        }

        for team in &deltas.team_roles_to_grant {
            exec.exec(&format!("GRANT {} TO {quoted_role}", quote_ident(team)))
                .await?;
            // Tables the role creates inside the team schema become readable
            // by the whole team.
            exec.exec(&format!(
                "ALTER DEFAULT PRIVILEGES FOR USER {quoted_role} IN SCHEMA {team} \
                 GRANT ALL ON TABLES TO {team}",
                team = quote_ident(team),
            ))
            .await?;
        }

        exec.exec(&format!(
            "GRANT CONNECT ON DATABASE {} TO {quoted_role}",
            quote_ident(dbname),
        ))
        .await?;

        exec.exec(&format!(
            "GRANT {quoted_role} TO {}",
            quote_ident(ephemeral_user),
        ))
        .await?;

        Ok(())
    }
}

/// Groups tuples by memorable name preserving first-occurrence order, then
/// appends forced databases that yielded no tuples.
fn group_by_database(
    allowed: &[SourceRef],
    force_databases: &[String],
) -> Vec<(String, Vec<SourceRef>)> {
    let mut groups: Vec<(String, Vec<SourceRef>)> = Vec::new();
    for r in allowed {
        match groups.iter_mut().find(|(db, _)| *db == r.database) {
            Some((_, tuples)) => tuples.push(r.clone()),
            None => groups.push((r.database.clone(), vec![r.clone()])),
        }
    }
    for forced in force_databases {
        if !groups.iter().any(|(db, _)| db == forced) {
            groups.push((forced.clone(), Vec::new()));
        }
    }
    groups
}

fn distinct_schemas(pairs: &[(String, String)]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    pairs
        .iter()
        .map(|(schema, _)| schema.clone())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn join_idents(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_tables(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(schema, table)| quote_qualified(schema, table))
        .collect::<Vec<_>>()
        .join(", ")
}
