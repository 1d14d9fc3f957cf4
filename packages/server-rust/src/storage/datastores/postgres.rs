//! `PostgreSQL` [`PatchStore`] implementation.
//!
//! Each batch becomes a single `UPDATE` whose `SET` list has one
//! `CASE t.id WHEN .. THEN .. ELSE t.col END` per column present in the
//! batch. Records that do not carry a column fall through to `ELSE` and keep
//! their stored value, which gives the sparse, idempotent-overwrite contract
//! in one atomic statement.

use std::sync::LazyLock;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use usagelog_core::{ColumnValue, SparseBatch};

use crate::storage::patch_store::PatchStore;

/// Default table holding one row per request.
pub const DEFAULT_TABLE: &str = "usage_logs";

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid identifier regex")
});

/// `PatchStore` writing into an existing `PostgreSQL` usage table.
///
/// Expected column types: `id bigint`, token counts / `duration_ms` /
/// `status_code` as integers, `cost_usd numeric`, `first_token_at` /
/// `completed_at timestamptz`, `finish_reason text`, `error` / `metadata jsonb`.
#[derive(Debug, Clone)]
pub struct PostgresPatchStore {
    pool: PgPool,
    table: String,
}

impl PostgresPatchStore {
    /// Wraps an existing pool, targeting [`DEFAULT_TABLE`].
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Connects a new pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect to usage database")?;
        Ok(Self::new(pool))
    }

    /// Targets a different table (optionally schema-qualified).
    ///
    /// # Errors
    ///
    /// Returns an error if `table` is not a plain SQL identifier.
    pub fn with_table(mut self, table: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(IDENTIFIER_RE.is_match(table), "invalid table name: {table:?}");
        self.table = table.to_string();
        Ok(self)
    }

    fn build_update<'a>(&self, batch: &'a SparseBatch) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} AS t SET ", self.table));

        for (i, (field, values)) in batch.columns().into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(field.as_str());
            qb.push(" = CASE t.id");
            for (id, value) in values {
                qb.push(" WHEN ");
                qb.push_bind(id.get());
                qb.push(" THEN ");
                push_value(&mut qb, value);
            }
            qb.push(" ELSE t.");
            qb.push(field.as_str());
            qb.push(" END");
        }

        qb.push(" WHERE t.id IN (");
        let mut ids = qb.separated(", ");
        for id in batch.ids() {
            ids.push_bind(id.get());
        }
        ids.push_unseparated(")");
        qb
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &ColumnValue) {
    match value {
        ColumnValue::Int(v) => {
            qb.push_bind(*v);
            qb.push("::bigint");
        }
        ColumnValue::Decimal(text) => {
            qb.push_bind(text.clone());
            qb.push("::numeric");
        }
        ColumnValue::Timestamp(Some(millis)) => {
            qb.push("to_timestamp(");
            qb.push_bind(*millis);
            qb.push("::bigint / 1000.0)");
        }
        ColumnValue::Timestamp(None) => {
            qb.push("NULL::timestamptz");
        }
        ColumnValue::Text(text) => {
            qb.push_bind(text.clone());
            qb.push("::text");
        }
        ColumnValue::Json(doc) => {
            qb.push_bind(doc.clone());
            qb.push("::jsonb");
        }
    }
}

#[async_trait]
impl PatchStore for PostgresPatchStore {
    async fn apply_batch(&self, batch: &SparseBatch) -> anyhow::Result<()> {
        let mut qb = self.build_update(batch);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .with_context(|| format!("apply usage batch of {} records", batch.len()))?;

        tracing::trace!(
            rows = result.rows_affected(),
            records = batch.len(),
            "usage batch applied"
        );
        Ok(())
    }
}
