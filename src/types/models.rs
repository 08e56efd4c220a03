use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a dataset is sourced and edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    Master,
    Datacut,
    Reference,
    Visualisation,
}

impl DatasetType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "master" => Some(Self::Master),
            "datacut" => Some(Self::Datacut),
            "reference" => Some(Self::Reference),
            "visualisation" => Some(Self::Visualisation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Datacut => "datacut",
            Self::Reference => "reference",
            Self::Visualisation => "visualisation",
        }
    }

    /// Only these dataset types contribute tables to database grants.
    #[must_use]
    pub fn grants_tables(&self) -> bool {
        matches!(self, Self::Master | Self::Datacut | Self::Reference)
    }
}

/// Who may read a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Open,
    RequiresAuthentication,
    RequiresAuthorization,
}

impl AccessMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "requires_authentication" => Some(Self::RequiresAuthentication),
            "requires_authorization" => Some(Self::RequiresAuthorization),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::RequiresAuthentication => "requires_authentication",
            Self::RequiresAuthorization => "requires_authorization",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub dataset_type: DatasetType,
    pub published: bool,
    pub deleted: bool,
    pub access: AccessMode,
    /// Email domains whose users are implicitly authorized.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_email_domains: Vec<String>,
    /// For reference datasets: the memorable name of the database holding the
    /// mirror table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_database: Option<String>,
    /// Reference datasets expose exactly one mirror table name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_table_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A `(database, schema, table)` a dataset draws from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTable {
    pub id: String,
    pub dataset_id: String,
    pub database: String,
    pub schema: String,
    pub table: String,
}

/// A catalog-authorized `(database, schema, table)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl SourceRef {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

/// Schema and table names accepted into GRANT statements. Everything else is
/// rejected before any SQL is composed.
pub fn validate_pg_name(name: &str, entity: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{entity} name '{name}' must match ^[A-Za-z][A-Za-z0-9_.]*$"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalRecord {
    pub id: String,
    /// Opaque, immutable SSO identifier. All role derivation keys off this.
    pub external_id: String,
    pub email: String,
    /// Privileged principals see unpublished datasets.
    pub privileged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrincipalRecord {
    /// The part after '@', lowercased; empty when the email is malformed.
    #[must_use]
    pub fn email_domain(&self) -> String {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    /// Slug under the reserved `_team_` schema prefix.
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl Team {
    #[must_use]
    pub fn schema_name(&self) -> String {
        crate::identity::team_role(&self.slug)
    }
}

/// An ephemeral login user recorded against the principal it was issued to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseUser {
    pub principal_id: String,
    pub database: String,
    pub ephemeral_user: String,
    pub created_at: DateTime<Utc>,
}

/// One ingested pgaudit statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAuditRow {
    pub database: String,
    pub occurred_at: DateTime<Utc>,
    pub rolname: String,
    /// pgaudit's session line number; part of the dedup key.
    pub session_line: String,
    pub principal_email: Option<String>,
    pub sql: String,
    pub kind: String,
}

/// The issued-credentials record handed back to callers and published to
/// object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub memorable_name: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_persistent_role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,
}

/// A service bearer token. Non-admin tokens belong to a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_pg_name() {
        assert!(validate_pg_name("public", "schema").is_ok());
        assert!(validate_pg_name("my_table2", "table").is_ok());
        assert!(validate_pg_name("a.b", "table").is_ok());
        assert!(validate_pg_name("", "schema").is_err());
        assert!(validate_pg_name("1public", "schema").is_err());
        assert!(validate_pg_name("_user_abc", "schema").is_err());
        assert!(validate_pg_name("bad name", "table").is_err());
        assert!(validate_pg_name("drop;--", "table").is_err());
    }

    #[test]
    fn test_email_domain() {
        let p = PrincipalRecord {
            id: "p1".into(),
            external_id: "x".into(),
            email: "Jane@Example.COM".into(),
            privileged: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(p.email_domain(), "example.com");
    }

    #[test]
    fn test_dataset_type_round_trip() {
        for t in [
            DatasetType::Master,
            DatasetType::Datacut,
            DatasetType::Reference,
            DatasetType::Visualisation,
        ] {
            assert_eq!(DatasetType::from_str(t.as_str()), Some(t));
        }
        assert!(DatasetType::Visualisation.grants_tables() == false);
        assert!(DatasetType::Master.grants_tables());
    }
}
