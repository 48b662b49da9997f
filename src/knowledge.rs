//! Knowledge registry: documents and URLs attached to a context, and the
//! ingestion status each one is in.
//!
//! The registry does no ingestion work. The external pipeline reports
//! progress through [`KnowledgeRegistry::advance_document_status`] and
//! [`KnowledgeRegistry::advance_url_status`]; the registry only validates
//! and records the transition.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{is_foreign_key_violation, query_failed, QueryKey, StoreError, StoreResult};
use crate::models::{
    IngestionStatus, KnowledgeDocument, KnowledgeFilter, KnowledgeUrl, Page, PageResult, Tenant,
};
use crate::store::{
    ensure_context, like_prefix, new_id, non_blank, now_millis, require, trace_from_row,
};

const DOCUMENT_TABLE: &str = "ai_knowledge_document";
const URL_TABLE: &str = "ai_knowledge_url";

const DOCUMENT_COLUMNS: &str = "id, tenant_id, name, doc_ref_id, status, context_id, \
     creation_date, creation_user, modification_date, modification_user, version";
const URL_COLUMNS: &str = "id, tenant_id, name, description, url, status, context_id, \
     creation_date, creation_user, modification_date, modification_user, version";

#[derive(Clone)]
pub struct KnowledgeRegistry {
    pool: SqlitePool,
    max_page_size: u32,
}

impl KnowledgeRegistry {
    pub fn new(pool: SqlitePool, max_page_size: u32) -> Self {
        Self {
            pool,
            max_page_size,
        }
    }

    // ============ Documents ============

    /// Register a document against a context. Starts in `NEW`.
    pub async fn add_document(
        &self,
        tenant: &Tenant,
        context_id: &str,
        name: &str,
        document_ref_id: &str,
    ) -> StoreResult<KnowledgeDocument> {
        require("name", name)?;
        require("document_ref_id", document_ref_id)?;
        ensure_context(&self.pool, tenant, context_id).await?;

        let id = new_id();
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_knowledge_document (id, tenant_id, name, doc_ref_id, status, context_id,
                                               creation_date, creation_user,
                                               modification_date, modification_user, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(tenant.id())
        .bind(name.trim())
        .bind(document_ref_id.trim())
        .bind(IngestionStatus::New.as_str())
        .bind(context_id)
        .bind(now)
        .bind(tenant.actor())
        .bind(now)
        .bind(tenant.actor())
        .execute(&self.pool)
        .await
        .map_err(|e| orphaned_insert(e, context_id))?;

        info!(tenant = %tenant, context_id, document_id = %id, "document registered");
        self.get_document(tenant, &id).await
    }

    pub async fn get_document(&self, tenant: &Tenant, id: &str) -> StoreResult<KnowledgeDocument> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = ? AND tenant_id = ?",
            DOCUMENT_COLUMNS, DOCUMENT_TABLE
        ))
        .bind(id)
        .bind(tenant.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed(QueryKey::FindById))?;

        match row {
            Some(row) => document_from_row(&row),
            None => Err(StoreError::not_found("document", id)),
        }
    }

    /// Move a document forward in its ingestion lifecycle.
    ///
    /// Fails with `Conflict` if `status` is not reachable from the current
    /// state (see [`IngestionStatus::predecessors`]).
    pub async fn advance_document_status(
        &self,
        tenant: &Tenant,
        id: &str,
        status: IngestionStatus,
    ) -> StoreResult<KnowledgeDocument> {
        if !self.advance(DOCUMENT_TABLE, tenant, id, status).await? {
            let current = self.get_document(tenant, id).await?;
            warn!(
                tenant = %tenant,
                document_id = %id,
                from = %current.status,
                to = %status,
                "rejected status transition"
            );
            return Err(illegal_transition("document", id, current.status, status));
        }
        info!(tenant = %tenant, document_id = %id, status = %status, "document status advanced");
        self.get_document(tenant, id).await
    }

    pub async fn find_documents(
        &self,
        tenant: &Tenant,
        filter: &KnowledgeFilter,
        page: Page,
    ) -> StoreResult<PageResult<KnowledgeDocument>> {
        page.validate(self.max_page_size)?;
        let key = QueryKey::FindDocumentsByCriteria;

        let mut count =
            QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {}", DOCUMENT_TABLE));
        push_criteria(&mut count, tenant, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed(key))?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {}",
            DOCUMENT_COLUMNS, DOCUMENT_TABLE
        ));
        push_criteria(&mut select, tenant, filter);
        push_page(&mut select, page);
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed(key))?;

        let stream = rows
            .iter()
            .map(document_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        debug!(tenant = %tenant, total, returned = stream.len(), "documents found");
        Ok(PageResult {
            number: page.number,
            size: page.size,
            total_elements: total,
            stream,
        })
    }

    pub async fn delete_document(&self, tenant: &Tenant, id: &str) -> StoreResult<()> {
        self.delete(DOCUMENT_TABLE, "document", tenant, id).await
    }

    // ============ URLs ============

    /// Register a web resource against a context. Starts in `NEW`.
    ///
    /// `url` must be an absolute `http` or `https` URL; it is stored as given.
    pub async fn add_url(
        &self,
        tenant: &Tenant,
        context_id: &str,
        name: &str,
        description: Option<&str>,
        url: &str,
    ) -> StoreResult<KnowledgeUrl> {
        require("name", name)?;
        let url = validate_url(url)?;
        ensure_context(&self.pool, tenant, context_id).await?;

        let id = new_id();
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_knowledge_url (id, tenant_id, name, description, url, status, context_id,
                                          creation_date, creation_user,
                                          modification_date, modification_user, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(tenant.id())
        .bind(name.trim())
        .bind(non_blank(description))
        .bind(&url)
        .bind(IngestionStatus::New.as_str())
        .bind(context_id)
        .bind(now)
        .bind(tenant.actor())
        .bind(now)
        .bind(tenant.actor())
        .execute(&self.pool)
        .await
        .map_err(|e| orphaned_insert(e, context_id))?;

        info!(tenant = %tenant, context_id, url_id = %id, "url registered");
        self.get_url(tenant, &id).await
    }

    pub async fn get_url(&self, tenant: &Tenant, id: &str) -> StoreResult<KnowledgeUrl> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = ? AND tenant_id = ?",
            URL_COLUMNS, URL_TABLE
        ))
        .bind(id)
        .bind(tenant.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed(QueryKey::FindById))?;

        match row {
            Some(row) => url_from_row(&row),
            None => Err(StoreError::not_found("url", id)),
        }
    }

    pub async fn advance_url_status(
        &self,
        tenant: &Tenant,
        id: &str,
        status: IngestionStatus,
    ) -> StoreResult<KnowledgeUrl> {
        if !self.advance(URL_TABLE, tenant, id, status).await? {
            let current = self.get_url(tenant, id).await?;
            warn!(
                tenant = %tenant,
                url_id = %id,
                from = %current.status,
                to = %status,
                "rejected status transition"
            );
            return Err(illegal_transition("url", id, current.status, status));
        }
        info!(tenant = %tenant, url_id = %id, status = %status, "url status advanced");
        self.get_url(tenant, id).await
    }

    pub async fn find_urls(
        &self,
        tenant: &Tenant,
        filter: &KnowledgeFilter,
        page: Page,
    ) -> StoreResult<PageResult<KnowledgeUrl>> {
        page.validate(self.max_page_size)?;
        let key = QueryKey::FindUrlsByCriteria;

        let mut count =
            QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {}", URL_TABLE));
        push_criteria(&mut count, tenant, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed(key))?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM {}", URL_COLUMNS, URL_TABLE));
        push_criteria(&mut select, tenant, filter);
        push_page(&mut select, page);
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed(key))?;

        let stream = rows
            .iter()
            .map(url_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        debug!(tenant = %tenant, total, returned = stream.len(), "urls found");
        Ok(PageResult {
            number: page.number,
            size: page.size,
            total_elements: total,
            stream,
        })
    }

    pub async fn delete_url(&self, tenant: &Tenant, id: &str) -> StoreResult<()> {
        self.delete(URL_TABLE, "url", tenant, id).await
    }

    // ============ Shared ============

    /// Conditional update: only rows currently in a predecessor state move.
    /// Returns whether a row was updated.
    async fn advance(
        &self,
        table: &str,
        tenant: &Tenant,
        id: &str,
        next: IngestionStatus,
    ) -> StoreResult<bool> {
        let allowed_from = next.predecessors();
        if allowed_from.is_empty() {
            return Ok(false);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET status = ", table));
        qb.push_bind(next.as_str())
            .push(", modification_date = ")
            .push_bind(now_millis())
            .push(", modification_user = ")
            .push_bind(tenant.actor().to_string())
            .push(", version = version + 1 WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND tenant_id = ")
            .push_bind(tenant.id().to_string())
            .push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in allowed_from {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(
        &self,
        table: &str,
        entity: &'static str,
        tenant: &Tenant,
        id: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ? AND tenant_id = ?",
            table
        ))
        .bind(id)
        .bind(tenant.id())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(entity, id));
        }
        info!(tenant = %tenant, id, entity, "knowledge source deleted");
        Ok(())
    }
}

/// Check that `raw` is an absolute `http` or `https` URL with a host.
///
/// Returns the trimmed input as given; the URL is not normalised.
pub fn validate_url(raw: &str) -> StoreResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::validation("url must not be empty"));
    }
    let parsed = url::Url::parse(trimmed).map_err(|e| {
        StoreError::validation(format!("url '{}' is not an absolute URI: {}", raw, e))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(StoreError::validation(format!(
            "url '{}' has unsupported scheme '{}': expected http or https",
            raw,
            parsed.scheme()
        )));
    }
    if !parsed.has_host() {
        return Err(StoreError::validation(format!("url '{}' has no host", raw)));
    }
    Ok(trimmed.to_string())
}

fn push_criteria(qb: &mut QueryBuilder<'_, Sqlite>, tenant: &Tenant, filter: &KnowledgeFilter) {
    qb.push(" WHERE tenant_id = ")
        .push_bind(tenant.id().to_string());
    if let Some(context_id) = &filter.context_id {
        qb.push(" AND context_id = ").push_bind(context_id.clone());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(prefix) = filter.name_prefix.as_deref().filter(|p| !p.is_empty()) {
        qb.push(" AND name LIKE ")
            .push_bind(like_prefix(prefix))
            .push(" ESCAPE '\\'");
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, page: Page) {
    qb.push(" ORDER BY creation_date ASC, rowid ASC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
}

/// An insert whose context vanished between the existence check and the
/// write loses the race: report the context as missing.
fn orphaned_insert(err: sqlx::Error, context_id: &str) -> StoreError {
    if is_foreign_key_violation(&err) {
        StoreError::not_found("context", context_id)
    } else {
        StoreError::Database(err)
    }
}

fn illegal_transition(
    entity: &str,
    id: &str,
    from: IngestionStatus,
    to: IngestionStatus,
) -> StoreError {
    let reason = if from.is_terminal() {
        format!("{} is terminal", from)
    } else if from == to {
        format!("already {}", from)
    } else {
        "status may only move forward".to_string()
    };
    StoreError::conflict(format!(
        "cannot move {} {} from {} to {}: {}",
        entity, id, from, to, reason
    ))
}

fn document_from_row(row: &SqliteRow) -> StoreResult<KnowledgeDocument> {
    let status: String = row.try_get("status")?;
    Ok(KnowledgeDocument {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        document_ref_id: row.try_get("doc_ref_id")?,
        status: status.parse()?,
        context_id: row.try_get("context_id")?,
        trace: trace_from_row(row)?,
    })
}

fn url_from_row(row: &SqliteRow) -> StoreResult<KnowledgeUrl> {
    let status: String = row.try_get("status")?;
    Ok(KnowledgeUrl {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        status: status.parse()?,
        context_id: row.try_get("context_id")?,
        trace: trace_from_row(row)?,
    })
}
