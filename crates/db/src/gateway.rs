use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use returndesk_core::domain::order::{parse_store_timestamp, OrderId, OrderRecord, OrderStatus};

use crate::repositories::RepositoryError;
use crate::DbPool;

/// One result row keyed by column name.
pub type QueryRow = BTreeMap<String, Value>;

const SAMPLE_ROWS: usize = 3;
const HIDDEN_TABLES: &[&str] = &["_sqlx_migrations", "conversation_message", "sqlite_sequence"];

/// Structured order/customer records the assistant may consult and mutate.
#[async_trait]
pub trait DataStoreGateway: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, RepositoryError>;

    /// Schema text for the named tables: each `CREATE` statement followed by sample rows.
    async fn get_schema(&self, table_names: &[String]) -> Result<String, RepositoryError>;

    /// Runs a read-only query. Writes are refused by the store itself.
    async fn execute(&self, query: &str) -> Result<Vec<QueryRow>, RepositoryError>;

    async fn find_order(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, RepositoryError>;

    /// Returns `false` when nothing changed (unknown order, or already in `status`).
    async fn update_order_status(
        &self,
        order_id: &OrderId,
        status: &OrderStatus,
    ) -> Result<bool, RepositoryError>;
}

#[derive(Clone)]
pub struct SqliteDataStore {
    pool: DbPool,
}

impl SqliteDataStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn create_statement(&self, table: &str) -> Result<String, RepositoryError> {
        let sql: Option<String> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        sql.ok_or_else(|| RepositoryError::UnknownTable(table.to_string()))
    }

    async fn sample_rows(&self, table: &str) -> Result<(Vec<String>, Vec<QueryRow>), RepositoryError> {
        let query = format!("SELECT * FROM {} LIMIT {SAMPLE_ROWS}", quote_identifier(table));
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|column| column.name().to_string()).collect())
            .unwrap_or_default();
        let decoded = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok((columns, decoded))
    }
}

#[async_trait]
impl DataStoreGateway for SqliteDataStore {
    async fn list_tables(&self) -> Result<Vec<String>, RepositoryError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names.into_iter().filter(|name| !HIDDEN_TABLES.contains(&name.as_str())).collect())
    }

    async fn get_schema(&self, table_names: &[String]) -> Result<String, RepositoryError> {
        let known = self.list_tables().await?;
        let mut sections = Vec::with_capacity(table_names.len());

        for requested in table_names {
            let table = requested.trim();
            let Some(table) = known.iter().find(|name| name.eq_ignore_ascii_case(table)) else {
                return Err(RepositoryError::UnknownTable(requested.clone()));
            };

            let create = self.create_statement(table).await?;
            let (columns, rows) = self.sample_rows(table).await?;
            sections.push(render_table_section(table, &create, &columns, &rows));
        }

        Ok(sections.join("\n\n"))
    }

    async fn execute(&self, query: &str) -> Result<Vec<QueryRow>, RepositoryError> {
        let mut conn = QueryOnlyConnection::acquire(&self.pool).await?;
        let outcome = conn.fetch_all(query).await;
        conn.restore().await?;

        outcome?.iter().map(decode_row).collect()
    }

    async fn find_order(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT order_id, order_status, order_delivered_customer_date
             FROM orders
             WHERE order_id = ?",
        )
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status: String = row.try_get("order_status")?;
            let delivered: Option<String> = row.try_get("order_delivered_customer_date")?;
            Ok(OrderRecord {
                order_id: OrderId(row.try_get("order_id")?),
                status: OrderStatus::parse(&status),
                delivered_at: delivered.as_deref().and_then(parse_store_timestamp),
            })
        })
        .transpose()
    }

    async fn update_order_status(
        &self,
        order_id: &OrderId,
        status: &OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE orders SET order_status = ?1 WHERE order_id = ?2 AND order_status <> ?1",
        )
        .bind(status.as_str())
        .bind(order_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// A pooled connection with `PRAGMA query_only` switched on.
///
/// Only [`QueryOnlyConnection::restore`] hands the connection back to the pool.
/// Dropped any other way (an error, or a cancelled future) it is detached and
/// closed, so no caller ever receives a read-only connection.
struct QueryOnlyConnection {
    conn: Option<PoolConnection<Sqlite>>,
}

impl QueryOnlyConnection {
    async fn acquire(pool: &DbPool) -> Result<Self, sqlx::Error> {
        let mut conn = Self { conn: Some(pool.acquire().await?) };
        if let Some(inner) = conn.conn.as_mut() {
            sqlx::query("PRAGMA query_only = ON").execute(&mut **inner).await?;
        }
        Ok(conn)
    }

    async fn fetch_all(&mut self, query: &str) -> Result<Vec<SqliteRow>, sqlx::Error> {
        match self.conn.as_mut() {
            Some(inner) => sqlx::query(query).fetch_all(&mut **inner).await,
            None => Err(sqlx::Error::PoolClosed),
        }
    }

    async fn restore(mut self) -> Result<(), sqlx::Error> {
        if let Some(inner) = self.conn.as_mut() {
            sqlx::query("PRAGMA query_only = OFF").execute(&mut **inner).await?;
        }
        // writable again
        self.conn.take();
        Ok(())
    }
}

impl Drop for QueryOnlyConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_table_section(table: &str, create: &str, columns: &[String], rows: &[QueryRow]) -> String {
    let mut section = format!("{}\n\n/*\n{} rows from {table} table:\n", create.trim(), rows.len());
    section.push_str(&columns.join("\t"));
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| match row.get(column) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => "None".to_string(),
                Some(other) => other.to_string(),
            })
            .collect();
        section.push('\n');
        section.push_str(&cells.join("\t"));
    }
    section.push_str("\n*/");
    section
}

fn decode_row(row: &SqliteRow) -> Result<QueryRow, RepositoryError> {
    let mut decoded = QueryRow::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Number::from_f64(row.try_get::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(index)?;
                    Value::String(format!("<{} bytes>", bytes.len()))
                }
                _ => Value::String(row.try_get::<String, _>(index)?),
            }
        };
        decoded.insert(column.name().to_string(), value);
    }

    Ok(decoded)
}
