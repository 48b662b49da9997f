//! SQLite-backed stores.
//!
//! [`Stores`] bundles the three stores that share one [`SqlitePool`]:
//!
//! | Store | Owns |
//! |-------|------|
//! | [`ContextStore`] | `ai_context` |
//! | [`KnowledgeRegistry`] | `ai_knowledge_document`, `ai_knowledge_url` |
//! | [`VectorBindings`] | `ai_knowledge_vdb` |
//!
//! Every statement filters on `tenant_id`. Each store method is its own unit
//! of work; none of them holds a transaction across an await on anything but
//! SQLite.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};

use crate::config::Config;
use crate::context_store::ContextStore;
use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeRegistry;
use crate::models::{Tenant, Traceable};
use crate::vector_binding::VectorBindings;

/// All stores over a single connection pool.
#[derive(Clone)]
pub struct Stores {
    pub contexts: ContextStore,
    pub knowledge: KnowledgeRegistry,
    pub bindings: VectorBindings,
}

impl Stores {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        let max_page_size = config.pagination.max_page_size;
        Self {
            contexts: ContextStore::new(pool.clone(), max_page_size),
            knowledge: KnowledgeRegistry::new(pool.clone(), max_page_size),
            bindings: VectorBindings::new(pool),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reject empty or whitespace-only required text fields.
pub(crate) fn require(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Map blank optional text to `None`.
pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn trace_from_row(row: &SqliteRow) -> Result<Traceable, sqlx::Error> {
    Ok(Traceable {
        creation_date: row.try_get("creation_date")?,
        creation_user: row.try_get("creation_user")?,
        modification_date: row.try_get("modification_date")?,
        modification_user: row.try_get("modification_user")?,
        version: row.try_get("version")?,
    })
}

/// Fail with `NotFound` unless the context exists for this tenant.
pub(crate) async fn ensure_context<'e, E>(
    executor: E,
    tenant: &Tenant,
    context_id: &str,
) -> StoreResult<()>
where
    E: SqliteExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM ai_context WHERE id = ? AND tenant_id = ?",
    )
    .bind(context_id)
    .bind(tenant.id())
    .fetch_one(executor)
    .await?;

    if !exists {
        return Err(StoreError::not_found("context", context_id));
    }
    Ok(())
}

/// Escape `%`, `_` and the escape char itself for a `LIKE ... ESCAPE '\'`.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
