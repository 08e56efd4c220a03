//! Postgres access for the data databases.
//!
//! All reconciler and introspection SQL goes through [`PgExec`] so tests can
//! observe and script the executed statements without a live server.

pub mod introspect;

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{NoTls, SimpleQueryMessage};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// A minimal SQL execution surface over one admin connection.
#[async_trait]
pub trait PgExec: Send + Sync {
    /// Runs a statement, returning the affected row count.
    async fn exec(&self, sql: &str) -> Result<u64>;

    /// Runs a query, returning rows of nullable text fields.
    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>>;
}

#[async_trait]
impl PgExec for tokio_postgres::Client {
    async fn exec(&self, sql: &str) -> Result<u64> {
        Ok(self.execute(sql, &[]).await?)
    }

    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let messages = self.simple_query(sql).await?;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                rows.push(
                    (0..row.len())
                        .map(|i| row.get(i).map(ToString::to_string))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }
}

/// Connects as the database's admin user, spawning the connection driver task.
///
/// `options` is passed as server session options, e.g.
/// `-c statement_timeout=300000`.
pub async fn connect_admin(
    db: &DatabaseConfig,
    options: &str,
) -> Result<tokio_postgres::Client> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&db.host)
        .port(db.port)
        .dbname(&db.dbname)
        .user(&db.user)
        .password(&db.password)
        .application_name("datagate")
        .connect_timeout(Duration::from_secs(30));
    if !options.is_empty() {
        config.options(options);
    }

    let (client, connection) = config.connect(NoTls).await?;
    let memorable_name = db.memorable_name.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("connection to {memorable_name} closed: {e}");
        }
    });

    Ok(client)
}

/// Abstracts "open an admin connection" so the reconciler and audit sync can
/// run against recorded fakes in tests.
#[async_trait]
pub trait PgConnector: Send + Sync {
    async fn connect(&self, db: &DatabaseConfig, options: &str) -> Result<Box<dyn PgExec>>;
}

/// Production connector backed by tokio-postgres.
pub struct TokioPgConnector;

#[async_trait]
impl PgConnector for TokioPgConnector {
    async fn connect(&self, db: &DatabaseConfig, options: &str) -> Result<Box<dyn PgExec>> {
        Ok(Box::new(connect_admin(db, options).await?))
    }
}

/// Quotes an SQL identifier, doubling any embedded double quote.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a `schema.table` pair.
#[must_use]
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quotes an SQL string literal, doubling any embedded single quote.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
