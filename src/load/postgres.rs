//! PostgreSQL [`TableStore`] backed by a `sqlx` connection pool.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, warn};

use crate::error::IngestionResult;
use crate::types::{ColumnConfig, EventKind, FieldType, TableSchema, TransformedRow, Value};

use super::TableStore;

/// Bind parameter limit of a single PostgreSQL statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Identifier length PostgreSQL keeps; longer names are silently truncated.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> IngestionResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Double-quote one identifier part.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name part by part: `a.b` becomes `"a"."b"`.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Last part of a possibly schema-qualified name.
fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

pub fn temp_table_name(table_name: &str, timestamp_suffix: &str) -> String {
    format!("{table_name}_tmp_{timestamp_suffix}")
}

pub fn column_sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "TEXT",
        FieldType::Number => "DOUBLE PRECISION",
        FieldType::Timestamp => "TIMESTAMPTZ",
    }
}

/// `CREATE TABLE` for the emitted columns of `schema`.
pub fn create_table_sql(table_name: &str, schema: &TableSchema) -> String {
    let mut defs: Vec<String> = schema
        .output_columns()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.sql_column), column_sql_type(c.field_type));
            if c.not_null {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    let primary: Vec<String> = schema
        .output_columns()
        .filter(|c| c.primary)
        .map(|c| quote_ident(&c.sql_column))
        .collect();
    if !primary.is_empty() {
        defs.push(format!("PRIMARY KEY ({})", primary.join(", ")));
    }

    format!("CREATE TABLE {} ({})", quote_qualified(table_name), defs.join(", "))
}

/// Index name `idx_<table>_<column>_<suffix>`, built from the final table name.
///
/// Names over [`MAX_IDENTIFIER_BYTES`] are cut and end in the first 8 hex digits of the full
/// name's SHA-256, so distinct columns keep distinct names.
pub fn index_name(final_table_name: &str, column: &str, timestamp_suffix: &str) -> String {
    let full = format!("idx_{}_{column}_{timestamp_suffix}", unqualified(final_table_name));
    if full.len() <= MAX_IDENTIFIER_BYTES {
        return full;
    }
    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let mut cut = MAX_IDENTIFIER_BYTES - 9;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &full[..cut], &digest[..8])
}

/// One `CREATE INDEX` on `tmp_table_name` per emitted column flagged `need_index`.
pub fn create_index_sql(
    final_table_name: &str,
    tmp_table_name: &str,
    schema: &TableSchema,
    timestamp_suffix: &str,
) -> Vec<String> {
    schema
        .output_columns()
        .filter(|c| c.need_index)
        .map(|c| {
            format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&index_name(final_table_name, &c.sql_column, timestamp_suffix)),
                quote_qualified(tmp_table_name),
                quote_ident(&c.sql_column)
            )
        })
        .collect()
}

/// Rows per `INSERT` so a statement stays within [`MAX_BIND_PARAMS`].
pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn push_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, column: &ColumnConfig) {
    match column.field_type {
        FieldType::String => b.push_bind(value.as_text()),
        FieldType::Number => b.push_bind(value.as_f64()),
        FieldType::Timestamp => b.push_bind(value.as_timestamp()),
    };
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn create_temp_table(
        &self,
        table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        timestamp_suffix: &str,
        group_hint: Option<EventKind>,
    ) -> IngestionResult<String> {
        let tmp = temp_table_name(table_name, timestamp_suffix);
        debug!(table = %tmp, columns = ?columns, hint = ?group_hint, "creating temp table");

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_qualified(&tmp)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(&tmp, table_config))
            .execute(&mut *tx)
            .await?;
        for stmt in create_index_sql(table_name, &tmp, table_config, timestamp_suffix) {
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(tmp)
    }

    async fn insert_batch(
        &self,
        tmp_table_name: &str,
        columns: &[String],
        table_config: &TableSchema,
        rows: &[TransformedRow],
    ) -> IngestionResult<()> {
        let configs: Vec<&ColumnConfig> = table_config.output_columns().collect();
        if configs.is_empty() {
            warn!(table = %tmp_table_name, rows = rows.len(), "table has no columns; rows not inserted");
            return Ok(());
        }

        let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(rows_per_statement(configs.len())) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({column_list}) ",
                quote_qualified(tmp_table_name)
            ));
            query_builder.push_values(chunk, |mut b, row| {
                for (value, column) in row.iter().zip(&configs) {
                    push_value(&mut b, value, column);
                }
            });
            query_builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn swap_tables(&self, tmp_table_name: &str, final_table_name: &str, truncate: bool) -> IngestionResult<()> {
        let tmp = quote_qualified(tmp_table_name);
        let target = quote_qualified(final_table_name);

        let mut tx = self.pool.begin().await?;
        if truncate {
            sqlx::query(&format!("DROP TABLE IF EXISTS {target}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "ALTER TABLE {tmp} RENAME TO {}",
                quote_ident(unqualified(final_table_name))
            ))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {target} (LIKE {tmp} INCLUDING ALL)"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("INSERT INTO {target} SELECT * FROM {tmp}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("DROP TABLE {tmp}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(tmp_table = %tmp_table_name, table = %final_table_name, truncate, "swapped tables");
        Ok(())
    }
}
