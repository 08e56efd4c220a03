//! Server-side cursor over a data database, feeding the download stream.

use tokio_postgres::SimpleQueryMessage;
use tokio_postgres::types::Type;
use uuid::Uuid;

use async_trait::async_trait;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::pg::{connect_admin, quote_ident};
use crate::stream::{ColumnDesc, Field, RowSource, UnfilteredStats};

/// A named NO SCROLL cursor inside a repeatable-read read-only transaction.
///
/// The cursor is declared against the filtered query; the optional
/// unfiltered query runs on the same connection only after the cursor is
/// closed, so one download never holds two open result sets.
pub struct PgCursor {
    client: tokio_postgres::Client,
    cursor_name: String,
    columns: Vec<ColumnDesc>,
    unfiltered_sql: Option<String>,
    cursor_open: bool,
}

impl PgCursor {
    /// Connects with the given session timeouts, inspects the query's
    /// column types, and declares the cursor.
    pub async fn open(
        db: &DatabaseConfig,
        sql: &str,
        unfiltered_sql: Option<String>,
        query_timeout_ms: u64,
        idle_in_txn_timeout_ms: u64,
        cursor_name: Option<String>,
    ) -> Result<Self> {
        let options = format!(
            "-c statement_timeout={query_timeout_ms} \
             -c idle_in_transaction_session_timeout={idle_in_txn_timeout_ms}"
        );
        let client = connect_admin(db, &options).await?;

        let statement = client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| ColumnDesc {
                name: c.name().to_string(),
                numeric: is_numeric(c.type_()),
            })
            .collect();

        let cursor_name = cursor_name
            .unwrap_or_else(|| format!("datagate_{}", Uuid::new_v4().simple()));
        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY;
                 DECLARE {} NO SCROLL CURSOR FOR {sql}",
                quote_ident(&cursor_name),
            ))
            .await?;

        Ok(Self {
            client,
            cursor_name,
            columns,
            unfiltered_sql,
            cursor_open: true,
        })
    }
}

#[async_trait]
impl RowSource for PgCursor {
    async fn columns(&mut self) -> Result<Vec<ColumnDesc>> {
        Ok(self.columns.clone())
    }

    async fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Field>>> {
        let messages = self
            .client
            .simple_query(&format!(
                "FETCH FORWARD {n} FROM {}",
                quote_ident(&self.cursor_name)
            ))
            .await?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let fields = (0..row.len())
                    .map(|i| match row.get(i) {
                        None => Field::Null,
                        Some(value) if self.columns[i].numeric => {
                            Field::Number(value.to_string())
                        }
                        Some(value) => Field::Text(value.to_string()),
                    })
                    .collect();
                rows.push(fields);
            }
        }
        Ok(rows)
    }

    async fn finish(&mut self) -> Result<()> {
        if self.cursor_open {
            self.cursor_open = false;
            self.client
                .batch_execute(&format!(
                    "CLOSE {}; COMMIT",
                    quote_ident(&self.cursor_name)
                ))
                .await?;
        }
        Ok(())
    }

    async fn unfiltered_stats(&mut self) -> Result<Option<UnfilteredStats>> {
        let Some(sql) = &self.unfiltered_sql else {
            return Ok(None);
        };

        let probe = self
            .client
            .prepare(&format!("SELECT * FROM ({sql}) unfiltered LIMIT 1"))
            .await?;
        let column_count = probe.columns().len() as u64;

        let count_sql = format!("SELECT COUNT(*) FROM ({sql}) unfiltered");
        let count_row = self.client.query_one(count_sql.as_str(), &[]).await?;
        let row_count: i64 = count_row.get(0);

        Ok(Some(UnfilteredStats {
            row_count: row_count as u64,
            column_count,
        }))
    }
}

/// Types written bare under QUOTE_NONNUMERIC.
fn is_numeric(ty: &Type) -> bool {
    [
        Type::INT2,
        Type::INT4,
        Type::INT8,
        Type::FLOAT4,
        Type::FLOAT8,
        Type::NUMERIC,
    ]
    .contains(ty)
}
