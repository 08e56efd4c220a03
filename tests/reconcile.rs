mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datagate::catalog::{SqliteStore, Store};
use datagate::config::DatabaseConfig;
use datagate::error::{Error, Result};
use datagate::identity;
use datagate::lock::{LockLease, LockProvider, StoreLock};
use datagate::pg::{PgConnector, PgExec};
use datagate::reconcile::Reconciler;
use datagate::types::{SourceRef, Team};

use common::{FakeConnector, RecordingExec, settings};

const VALID_FOR: Duration = Duration::from_secs(3600);

fn setup(connector: FakeConnector) -> (Reconciler, Arc<SqliteStore>) {
    let store = common::store();
    let lock = Arc::new(StoreLock::new(store.clone()));
    let reconciler = Reconciler::new(settings(), store.clone(), lock, Arc::new(connector));
    (reconciler, store)
}

fn t(db: &str, schema: &str, table: &str) -> SourceRef {
    SourceRef::new(db, schema, table)
}

#[tokio::test]
async fn test_first_issuance_creates_role_schema_and_grants() {
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "t".to_string()));
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let role = identity::persistent_role(&principal.external_id);
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    let outcome = reconciler
        .issue_credentials(&principal, &[t("main", "public", "t")], &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    assert_eq!(outcome.credentials.len(), 1);
    assert!(outcome.failures.is_empty());
    let credentials = &outcome.credentials[0];
    assert_eq!(credentials.memorable_name, "main");
    assert_eq!(credentials.db_persistent_role, role);
    assert_eq!(credentials.db_user, ephemeral);
    assert!(credentials.db_password.is_some());

    let statements = exec.statements();
    let has = |needle: &str| statements.iter().any(|s| s.contains(needle));

    assert!(has(&format!("CREATE ROLE \"{role}\"")));
    assert!(has(&format!(
        "CREATE SCHEMA IF NOT EXISTS \"{role}\" AUTHORIZATION \"{role}\""
    )));
    assert!(has(&format!("GRANT USAGE ON SCHEMA \"public\" TO \"{role}\"")));
    assert!(has(&format!("GRANT SELECT ON \"public\".\"t\" TO \"{role}\"")));
    assert!(has(&format!("CREATE USER \"{ephemeral}\" WITH PASSWORD")));
    assert!(has("VALID UNTIL"));
    assert!(has(&format!(
        "GRANT CONNECT ON DATABASE \"warehouse\" TO \"{role}\""
    )));
    assert!(has(&format!("GRANT \"{role}\" TO \"{ephemeral}\"")));
    assert!(has(&format!("ALTER USER \"{ephemeral}\" SET ROLE \"{role}\"")));

    // The issued login is recorded against the principal for audit sync.
    let resolved = store
        .find_principal_for_login("main", &ephemeral)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.id, principal.id);
}

#[tokio::test]
async fn test_second_issuance_with_same_tables_grants_nothing() {
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "t".to_string()));
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();
    let allowed = [t("main", "public", "t")];

    reconciler
        .issue_credentials(&principal, &allowed, &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    // Converge the fake database to the state the first call produced.
    *exec.held_tables.lock().unwrap() = vec![("public".to_string(), "t".to_string())];
    *exec.held_schemas.lock().unwrap() = vec!["public".to_string()];
    exec.executed.lock().unwrap().clear();

    let ephemeral2 = identity::ephemeral_user_name(&principal.email, "again").unwrap();
    reconciler
        .issue_credentials(&principal, &allowed, &ephemeral2, VALID_FOR, &[])
        .await
        .unwrap();

    assert!(exec.statements_containing("GRANT SELECT ON").is_empty());
    assert!(exec.statements_containing("GRANT USAGE ON SCHEMA").is_empty());
    assert!(exec.statements_containing("REVOKE").is_empty());
    // The unconditional tail still runs.
    assert_eq!(exec.statements_containing("GRANT CONNECT").len(), 1);
}

#[tokio::test]
async fn test_removed_permission_is_revoked_but_role_remains() {
    let exec = RecordingExec::default();
    *exec.held_tables.lock().unwrap() = vec![("public".to_string(), "t".to_string())];
    *exec.held_schemas.lock().unwrap() = vec!["public".to_string()];
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let role = identity::persistent_role(&principal.external_id);
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    // No tables left; the forced database still gets a login.
    let outcome = reconciler
        .issue_credentials(&principal, &[], &ephemeral, VALID_FOR, &["main".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.credentials.len(), 1);

    let statements = exec.statements();
    let has = |needle: &str| statements.iter().any(|s| s.contains(needle));
    assert!(has(&format!(
        "REVOKE ALL PRIVILEGES ON SCHEMA \"public\" FROM \"{role}\""
    )));
    assert!(has(&format!(
        "REVOKE ALL PRIVILEGES ON \"public\".\"t\" FROM \"{role}\""
    )));
    // The persistent role and its schema are never dropped.
    assert!(has(&format!("CREATE ROLE \"{role}\"")));
    assert!(!has("DROP ROLE"));
    assert!(!has("DROP SCHEMA"));
}

#[tokio::test]
async fn test_revokes_are_applied_before_grants() {
    let exec = RecordingExec::default();
    *exec.existing_tables.lock().unwrap() = vec![
        ("public".to_string(), "new".to_string()),
        ("public".to_string(), "old".to_string()),
    ];
    *exec.held_tables.lock().unwrap() = vec![("public".to_string(), "old".to_string())];
    *exec.held_schemas.lock().unwrap() = vec!["public".to_string()];
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    reconciler
        .issue_credentials(&principal, &[t("main", "public", "new")], &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    let statements = exec.statements();
    let position = |needle: &str| {
        statements
            .iter()
            .position(|s| s.contains(needle))
            .unwrap_or_else(|| panic!("no statement containing {needle}"))
    };

    let revoke = position("REVOKE ALL PRIVILEGES ON \"public\".\"old\"");
    let grant = position("GRANT SELECT ON \"public\".\"new\"");
    let grant_login = position("GRANT CONNECT");
    assert!(revoke < grant);
    assert!(grant < grant_login);
}

#[tokio::test]
async fn test_team_membership_propagates_default_privileges() {
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "t".to_string()));
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let role = identity::persistent_role(&principal.external_id);
    let team = Team {
        id: "team-1".to_string(),
        name: "Data Engineering".to_string(),
        slug: "data_eng".to_string(),
        created_at: chrono::Utc::now(),
    };
    store.create_team(&team).unwrap();
    store.add_team_member(&team.id, &principal.id).unwrap();

    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();
    reconciler
        .issue_credentials(&principal, &[t("main", "public", "t")], &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    let statements = exec.statements();
    let has = |needle: &str| statements.iter().any(|s| s.contains(needle));
    assert!(has("CREATE ROLE \"_team_data_eng\""));
    assert!(has(&format!("GRANT \"_team_data_eng\" TO \"{role}\"")));
    assert!(has(&format!(
        "ALTER DEFAULT PRIVILEGES FOR USER \"{role}\" IN SCHEMA \"_team_data_eng\" \
         GRANT ALL ON TABLES TO \"_team_data_eng\""
    )));
}

#[tokio::test]
async fn test_missing_admin_memberships_granted_first() {
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "t".to_string()));
    *exec.missing_roles.lock().unwrap() = vec!["_user_deadbeef".to_string()];
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    reconciler
        .issue_credentials(&principal, &[t("main", "public", "t")], &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    let statements = exec.statements();
    assert_eq!(
        statements.first().map(String::as_str),
        Some("GRANT \"_user_deadbeef\" TO \"dg_admin\"")
    );
}

#[tokio::test]
async fn test_failing_database_does_not_block_the_rest() {
    let exec = RecordingExec::default();
    *exec.existing_tables.lock().unwrap() = vec![
        ("public".to_string(), "a".to_string()),
        ("public".to_string(), "b".to_string()),
    ];
    let mut connector = FakeConnector::new(exec.clone());
    connector.failing.push("reporting".to_string());
    let (reconciler, store) = setup(connector);

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    let outcome = reconciler
        .issue_credentials(
            &principal,
            &[t("main", "public", "a"), t("reporting", "public", "b")],
            &ephemeral,
            VALID_FOR,
            &[],
        )
        .await
        .unwrap();

    assert_eq!(outcome.credentials.len(), 1);
    assert_eq!(outcome.credentials[0].memorable_name, "main");
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].0, "reporting");
}

#[tokio::test]
async fn test_no_tables_and_no_forced_databases_is_not_authorized() {
    let (reconciler, store) = setup(FakeConnector::new(RecordingExec::default()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    let result = reconciler
        .issue_credentials(&principal, &[], &ephemeral, VALID_FOR, &[])
        .await;
    assert!(matches!(result, Err(Error::NotAuthorized(_))));
}

/// Delegates to a real store lock but reports every release as failed.
struct BrokenReleaseLock(StoreLock);

#[async_trait]
impl LockProvider for BrokenReleaseLock {
    async fn acquire(
        &self,
        key: &str,
        blocking_timeout: Duration,
        lease: Duration,
    ) -> Result<LockLease> {
        self.0.acquire(key, blocking_timeout, lease).await
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        self.0.release(lease).await?;
        Err(Error::Config("lock backend unreachable".to_string()))
    }
}

/// Records like the shared fake, but GRANT CONNECT fails.
struct GrantConnectFails(RecordingExec);

#[async_trait]
impl PgExec for GrantConnectFails {
    async fn exec(&self, sql: &str) -> Result<u64> {
        if sql.starts_with("GRANT CONNECT") {
            return Err(Error::Config("connection reset".to_string()));
        }
        self.0.exec(sql).await
    }

    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        self.0.query_text(sql).await
    }
}

struct FaultyConnector(RecordingExec);

#[async_trait]
impl PgConnector for FaultyConnector {
    async fn connect(&self, _db: &DatabaseConfig, _options: &str) -> Result<Box<dyn PgExec>> {
        Ok(Box::new(GrantConnectFails(self.0.clone())))
    }
}

#[tokio::test]
async fn test_failed_apply_surfaces_even_when_lock_release_fails() {
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "t".to_string()));

    let store = common::store();
    let lock = Arc::new(BrokenReleaseLock(StoreLock::new(store.clone())));
    let reconciler = Reconciler::new(
        settings(),
        store.clone(),
        lock,
        Arc::new(FaultyConnector(exec.clone())),
    );

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    let outcome = reconciler
        .issue_credentials(&principal, &[t("main", "public", "t")], &ephemeral, VALID_FOR, &[])
        .await
        .unwrap();

    // The database's failure is the apply failure, not the release failure.
    assert!(outcome.credentials.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    let message = outcome.failures[0].1.to_string();
    assert!(message.contains("connection reset"), "got: {message}");
}

#[tokio::test]
async fn test_tables_missing_from_database_are_not_granted() {
    // Catalog says two tables, the database only has one.
    let exec = RecordingExec::default();
    exec.existing_tables
        .lock()
        .unwrap()
        .push(("public".to_string(), "present".to_string()));
    let (reconciler, store) = setup(FakeConnector::new(exec.clone()));

    let principal = common::principal(&store, "sso-1", "jane@example.com");
    let ephemeral = identity::ephemeral_user_name(&principal.email, "").unwrap();

    reconciler
        .issue_credentials(
            &principal,
            &[t("main", "public", "present"), t("main", "public", "ghost")],
            &ephemeral,
            VALID_FOR,
            &[],
        )
        .await
        .unwrap();

    let grants = exec.statements_containing("GRANT SELECT ON");
    assert_eq!(grants.len(), 1);
    assert!(grants[0].contains("\"public\".\"present\""));
    assert!(!grants[0].contains("ghost"));
}
