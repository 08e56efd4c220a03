pub const SCHEMA: &str = r#"
-- Principals arrive pre-authenticated from the surrounding platform.
CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,  -- opaque SSO identifier, immutable
    email TEXT NOT NULL,
    privileged INTEGER NOT NULL DEFAULT 0,  -- if 1, sees unpublished datasets
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dataset_type TEXT NOT NULL,       -- master | datacut | reference | visualisation
    published INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    access TEXT NOT NULL,             -- open | requires_authentication | requires_authorization
    authorized_email_domains TEXT NOT NULL DEFAULT '[]',  -- JSON array
    external_database TEXT,           -- reference datasets: mirror database memorable name
    reference_table_name TEXT,        -- reference datasets: mirror table name
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS source_tables (
    id TEXT PRIMARY KEY,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    database TEXT NOT NULL,           -- memorable name
    schema TEXT NOT NULL,
    tbl TEXT NOT NULL,
    UNIQUE(dataset_id, database, schema, tbl)
);

-- Grants read when the dataset access mode is requires_authorization
CREATE TABLE IF NOT EXISTS dataset_user_permissions (
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (principal_id, dataset_id)
);

-- Grants an application template (not a user) access to a dataset
CREATE TABLE IF NOT EXISTS application_template_permissions (
    application_template TEXT NOT NULL,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (application_template, dataset_id)
);

CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,        -- schema name is '_team_' || slug
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS team_memberships (
    team_id TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (team_id, principal_id)
);

-- Ephemeral login users the reconciler has issued, per database
CREATE TABLE IF NOT EXISTS database_users (
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    database TEXT NOT NULL,
    ephemeral_user TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (database, ephemeral_user)
);

-- Append-only pgaudit ingestion; dedup key is the UNIQUE index
CREATE TABLE IF NOT EXISTS query_audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    rolname TEXT NOT NULL,
    session_line TEXT NOT NULL,
    principal_email TEXT,
    sql TEXT NOT NULL,
    kind TEXT NOT NULL,
    UNIQUE(database, occurred_at, rolname, session_line)
);

-- Bearer tokens for the service's own HTTP surface
CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,        -- first 8 chars for fast lookup
    is_admin INTEGER NOT NULL DEFAULT 0,
    principal_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,                   -- NULL = never
    last_used_at TEXT
);

-- Lease-based locks; the shared catalog plays the role of the kv store
CREATE TABLE IF NOT EXISTS locks (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Small process-coordination values (audit task floor, etc.)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_source_tables_dataset ON source_tables(dataset_id);
CREATE INDEX IF NOT EXISTS idx_user_permissions_principal ON dataset_user_permissions(principal_id);
CREATE INDEX IF NOT EXISTS idx_memberships_principal ON team_memberships(principal_id);
CREATE INDEX IF NOT EXISTS idx_database_users_principal ON database_users(principal_id);
CREATE INDEX IF NOT EXISTS idx_audit_database_time ON query_audit_logs(database, occurred_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_lookup ON tokens(token_lookup);
CREATE INDEX IF NOT EXISTS idx_tokens_principal ON tokens(principal_id);
"#;
