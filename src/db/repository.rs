use crate::db::models::{ApplyPlan, StoredColumn, SyncResult};
use crate::error::{AppError, Result};
use crate::schema::{ColumnType, TableSpec};
use crate::sentinel::SentinelCodec;
use crate::table::{Table, Value, TIMESTAMP_FORMAT};
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, TypeInfo, ValueRef};
use std::fmt::Display;
use std::path::Path;
use tracing::{debug, info};

/// SQLite caps bound parameters per statement at 32766.
const MAX_BIND_PARAMS: usize = 32_000;

pub struct Repository {
    pool: SqlitePool,
    codec: SentinelCodec,
}

impl Repository {
    pub fn new(pool: SqlitePool, codec: SentinelCodec) -> Self {
        Self { pool, codec }
    }

    /// Open (creating if needed) the SQLite file at `path`.
    pub async fn connect(path: &Path, max_connections: u32, codec: SentinelCodec) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool, codec))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn codec(&self) -> &SentinelCodec {
        &self.codec
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn stored_columns(&self, table: &str) -> Result<Vec<StoredColumn>> {
        let mut conn = self.pool.acquire().await?;
        stored_columns(&mut *conn, table).await
    }

    /// Read the whole table once. Sentinels come back as `Missing`; values
    /// keep their storage class and still need type enforcement.
    pub async fn load_table(&self, spec: &TableSpec) -> Result<Table> {
        let names: Vec<String> = self
            .stored_columns(&spec.name)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        if names.is_empty() {
            return Ok(Table::default());
        }

        let sql = format!(
            "SELECT {} FROM {}",
            names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", "),
            quote_ident(&spec.name)
        );
        let rows: Vec<SqliteRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut table = Table::new(names);
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(self.codec.decode(decode_cell(row, idx)?));
            }
            table.push_row(values);
        }

        debug!("Loaded {} rows from {}", table.len(), spec.name);
        Ok(table)
    }

    /// Apply every plan inside one transaction. Any failure rolls back all of them.
    pub async fn apply(&self, plans: &[ApplyPlan]) -> Result<Vec<SyncResult>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(plans.len());

        for plan in plans {
            results.push(apply_plan(&mut *tx, plan, &self.codec).await?);
        }

        tx.commit().await?;

        for result in &results {
            debug!(
                "Committed {}: {} inserted, {} updated, {} unchanged{}{}",
                result.table,
                result.inserted,
                result.updated,
                result.unchanged,
                if result.suppressed > 0 {
                    format!(", {} updates suppressed (append-only)", result.suppressed)
                } else {
                    String::new()
                },
                if result.created { " (table created)" } else { "" }
            );
        }

        Ok(results)
    }
}

async fn apply_plan(
    conn: &mut SqliteConnection,
    plan: &ApplyPlan,
    codec: &SentinelCodec,
) -> Result<SyncResult> {
    let spec = &plan.spec;

    if plan.create {
        create_table(conn, spec, &plan.columns).await?;
    } else if !plan.inserts.is_empty() || !plan.updates.is_empty() {
        add_missing_columns(conn, spec, &plan.columns).await?;
    }

    let inserted = insert_rows(conn, plan, codec).await?;
    let updated = update_rows(conn, plan, codec).await?;

    Ok(SyncResult {
        table: spec.name.clone(),
        created: plan.create,
        inserted,
        updated,
        unchanged: plan.unchanged,
        suppressed: plan.suppressed,
    })
}

async fn stored_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<StoredColumn>> {
    let columns = sqlx::query_as::<_, StoredColumn>(
        "SELECT name, type AS declared_type FROM pragma_table_info(?1) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    Ok(columns)
}

fn column_definition(spec: &TableSpec, column: &str) -> String {
    if spec.is_key(column) {
        format!("{} TEXT NOT NULL DEFAULT ''", quote_ident(column))
    } else {
        let sql_type = spec
            .column_type(column)
            .map(|t| t.sql_type())
            .unwrap_or("TEXT");
        format!("{} {}", quote_ident(column), sql_type)
    }
}

/// Create the table from the batch columns (plus any key column the batch
/// lacks) and its unique natural-key index.
async fn create_table(conn: &mut SqliteConnection, spec: &TableSpec, columns: &[String]) -> Result<()> {
    let mut definitions: Vec<String> = columns.iter().map(|c| column_definition(spec, c)).collect();
    for key in &spec.key {
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(key)) {
            definitions.push(column_definition(spec, key));
        }
    }

    let sql = format!(
        "CREATE TABLE {} ({})",
        quote_ident(&spec.name),
        definitions.join(", ")
    );
    sqlx::query(&sql).execute(&mut *conn).await?;

    let index = format!(
        "CREATE UNIQUE INDEX {} ON {} ({})",
        quote_ident(&format!("ux_{}_natural_key", spec.name)),
        quote_ident(&spec.name),
        spec.key.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ")
    );
    sqlx::query(&index).execute(&mut *conn).await?;

    info!(
        "Created table {} ({} columns) keyed on ({})",
        spec.name,
        definitions.len(),
        spec.key.join(", ")
    );
    Ok(())
}

/// Add batch columns the stored table does not have yet.
async fn add_missing_columns(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    columns: &[String],
) -> Result<()> {
    let stored = stored_columns(conn, &spec.name).await?;
    for column in columns {
        if stored.iter().any(|s| s.name.eq_ignore_ascii_case(column)) {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(&spec.name),
            column_definition(spec, column)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        info!("Added column {} to {}", column, spec.name);
    }
    Ok(())
}

/// Plain inserts; a key already present surfaces as `ConstraintViolation`.
async fn insert_rows(conn: &mut SqliteConnection, plan: &ApplyPlan, codec: &SentinelCodec) -> Result<usize> {
    if plan.inserts.is_empty() {
        return Ok(0);
    }

    let table = &plan.spec.name;
    let layout = column_layout(plan);
    let column_list = plan
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let rows_per_chunk = (MAX_BIND_PARAMS / plan.columns.len().max(1)).max(1);
    let chunk_count = plan.inserts.len().div_ceil(rows_per_chunk);
    let mut inserted = 0;

    for (chunk_idx, chunk) in plan.inserts.chunks(rows_per_chunk).enumerate() {
        debug!(
            "Inserting into {} batch {}/{} ({} rows)",
            table,
            chunk_idx + 1,
            chunk_count,
            chunk.len()
        );

        let mut query_builder =
            QueryBuilder::<Sqlite>::new(format!("INSERT INTO {} ({}) ", quote_ident(table), column_list));

        query_builder.push_values(chunk, |mut b, row| {
            for (value, (column_type, is_key)) in row.iter().zip(&layout) {
                bind_value(&mut b, storage_value(value, *column_type, *is_key, codec), true);
            }
        });

        let result = query_builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::from_write(table, e))?;

        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

/// Overwrite the batch's non-key columns of each matching stored row.
async fn update_rows(conn: &mut SqliteConnection, plan: &ApplyPlan, codec: &SentinelCodec) -> Result<usize> {
    let table = &plan.spec.name;
    let layout = column_layout(plan);
    let set_columns: Vec<usize> = (0..plan.columns.len())
        .filter(|&idx| !layout[idx].1)
        .collect();
    if plan.updates.is_empty() || set_columns.is_empty() {
        return Ok(0);
    }

    let key_positions: Vec<Option<usize>> = plan
        .spec
        .key
        .iter()
        .map(|k| plan.columns.iter().position(|c| c.eq_ignore_ascii_case(k)))
        .collect();

    let mut updated = 0;
    for row in &plan.updates {
        let mut query_builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", quote_ident(table)));
        {
            let mut assignments = query_builder.separated(", ");
            for &idx in &set_columns {
                assignments.push(format!("{} = ", quote_ident(&plan.columns[idx])));
                let (column_type, _) = layout[idx];
                bind_value(&mut assignments, storage_value(&row[idx], column_type, false, codec), false);
            }
        }

        query_builder.push(" WHERE ");
        {
            let mut filter = query_builder.separated(" AND ");
            for (key, position) in plan.spec.key.iter().zip(&key_positions) {
                filter.push(format!("{} = ", quote_ident(key)));
                let key_text = position.map(|idx| row[idx].key_text()).unwrap_or_default();
                filter.push_bind_unseparated(key_text);
            }
        }

        let result = query_builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::from_write(table, e))?;

        if result.rows_affected() == 0 {
            let key: Vec<String> = key_positions
                .iter()
                .map(|p| p.map(|idx| row[idx].key_text()).unwrap_or_default())
                .collect();
            return Err(AppError::InvalidData(format!(
                "update of {} matched no stored row for key ({})",
                table,
                key.join(", ")
            )));
        }
        updated += 1;
    }

    Ok(updated)
}

/// (declared type, is key column) for each plan column.
fn column_layout(plan: &ApplyPlan) -> Vec<(Option<ColumnType>, bool)> {
    plan.columns
        .iter()
        .map(|c| (plan.spec.column_type(c), plan.spec.is_key(c)))
        .collect()
}

/// Value as written: key parts are never NULL, other missing cells follow the codec.
fn storage_value(value: &Value, column_type: Option<ColumnType>, is_key: bool, codec: &SentinelCodec) -> Value {
    if is_key {
        Value::Text(value.key_text())
    } else {
        codec.encode(value, column_type)
    }
}

fn bind_value<'args, Sep: Display>(b: &mut Separated<'_, 'args, Sqlite, Sep>, value: Value, separated: bool) {
    match (value, separated) {
        (Value::Missing, true) => b.push_bind(None::<String>),
        (Value::Missing, false) => b.push_bind_unseparated(None::<String>),
        (Value::Text(s), true) => b.push_bind(s),
        (Value::Text(s), false) => b.push_bind_unseparated(s),
        (Value::Integer(i), true) => b.push_bind(i),
        (Value::Integer(i), false) => b.push_bind_unseparated(i),
        (Value::Float(f), true) => b.push_bind(f),
        (Value::Float(f), false) => b.push_bind_unseparated(f),
        (Value::Timestamp(ts), true) => b.push_bind(ts.format(TIMESTAMP_FORMAT).to_string()),
        (Value::Timestamp(ts), false) => {
            b.push_bind_unseparated(ts.format(TIMESTAMP_FORMAT).to_string())
        }
    };
}

fn decode_cell(row: &SqliteRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Missing);
    }
    let storage_class = raw.type_info().name().to_string();
    let value = match storage_class.as_str() {
        "INTEGER" => Value::Integer(row.try_get::<i64, _>(idx)?),
        "REAL" => Value::Float(row.try_get::<f64, _>(idx)?),
        "TEXT" => Value::Text(row.try_get::<String, _>(idx)?),
        _ => Value::Text(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(idx)?).into_owned()),
    };
    Ok(value)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
