//! Context store: the tenant-scoped `AiContext` records that knowledge
//! sources and vector bindings hang off.
//!
//! Deletion never cascades. A context with any document, URL, or vector
//! binding still attached is rejected with [`StoreError::Conflict`]; callers
//! detach dependents first.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{query_failed, QueryKey, StoreError, StoreResult};
use crate::models::{AiContext, Page, PageResult, Tenant};
use crate::store::{new_id, non_blank, now_millis, require, trace_from_row};

const CONTEXT_COLUMNS: &str = "id, tenant_id, name, description, creation_date, creation_user, \
     modification_date, modification_user, version";

#[derive(Clone)]
pub struct ContextStore {
    pool: SqlitePool,
    max_page_size: u32,
}

impl ContextStore {
    pub fn new(pool: SqlitePool, max_page_size: u32) -> Self {
        Self {
            pool,
            max_page_size,
        }
    }

    pub async fn create_context(&self, tenant: &Tenant, name: &str) -> StoreResult<AiContext> {
        self.create_context_with_description(tenant, name, None).await
    }

    pub async fn create_context_with_description(
        &self,
        tenant: &Tenant,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<AiContext> {
        require("name", name)?;

        let id = new_id();
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_context (id, tenant_id, name, description,
                                    creation_date, creation_user,
                                    modification_date, modification_user, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(tenant.id())
        .bind(name.trim())
        .bind(non_blank(description))
        .bind(now)
        .bind(tenant.actor())
        .bind(now)
        .bind(tenant.actor())
        .execute(&self.pool)
        .await?;

        info!(tenant = %tenant, context_id = %id, "context created");
        self.get_context(tenant, &id).await
    }

    pub async fn get_context(&self, tenant: &Tenant, id: &str) -> StoreResult<AiContext> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ai_context WHERE id = ? AND tenant_id = ?",
            CONTEXT_COLUMNS
        ))
        .bind(id)
        .bind(tenant.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed(QueryKey::FindById))?;

        match row {
            Some(row) => Ok(context_from_row(&row)?),
            None => Err(StoreError::not_found("context", id)),
        }
    }

    /// Update name and description.
    pub async fn rename_context(
        &self,
        tenant: &Tenant,
        id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<AiContext> {
        require("name", name)?;

        let result = sqlx::query(
            r#"
            UPDATE ai_context
            SET name = ?, description = ?, modification_date = ?,
                modification_user = ?, version = version + 1
            WHERE id = ? AND tenant_id = ?
            "#,
        )
        .bind(name.trim())
        .bind(non_blank(description))
        .bind(now_millis())
        .bind(tenant.actor())
        .bind(id)
        .bind(tenant.id())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("context", id));
        }
        info!(tenant = %tenant, context_id = %id, "context renamed");
        self.get_context(tenant, id).await
    }

    /// Delete a context that has no dependents.
    ///
    /// The dependency check and the delete are one statement, so a source
    /// added concurrently either lands first (and the delete conflicts) or
    /// fails its foreign key against the deleted row. If the blocking
    /// dependents are gone by the time they are counted, the delete is
    /// attempted once more.
    pub async fn delete_context(&self, tenant: &Tenant, id: &str) -> StoreResult<()> {
        let mut blocked_by = self.try_delete(tenant, id).await?;
        if blocked_by.as_ref().is_some_and(Dependents::is_empty) {
            debug!(tenant = %tenant, context_id = %id, "dependents vanished, retrying delete");
            blocked_by = self.try_delete(tenant, id).await?;
        }

        match blocked_by {
            None => {
                info!(tenant = %tenant, context_id = %id, "context deleted");
                Ok(())
            }
            Some(deps) if deps.is_empty() => Err(StoreError::conflict(format!(
                "context {} was referenced by knowledge sources or a vector binding",
                id
            ))),
            Some(deps) => Err(StoreError::conflict(format!(
                "context {} is still referenced by {} document(s), {} url(s) and {} vector binding(s)",
                id, deps.documents, deps.urls, deps.bindings
            ))),
        }
    }

    /// `None` once deleted; otherwise what was still attached when counted.
    async fn try_delete(&self, tenant: &Tenant, id: &str) -> StoreResult<Option<Dependents>> {
        if self.delete_unreferenced(tenant, id).await? {
            return Ok(None);
        }
        // Nothing deleted: either absent or still referenced.
        self.get_context(tenant, id).await?;
        Ok(Some(self.dependents(tenant, id).await?))
    }

    async fn delete_unreferenced(&self, tenant: &Tenant, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM ai_context
            WHERE id = ? AND tenant_id = ?
              AND NOT EXISTS (SELECT 1 FROM ai_knowledge_document d
                              WHERE d.context_id = ai_context.id)
              AND NOT EXISTS (SELECT 1 FROM ai_knowledge_url u
                              WHERE u.context_id = ai_context.id)
              AND NOT EXISTS (SELECT 1 FROM ai_knowledge_vdb v
                              WHERE v.context_id = ai_context.id)
            "#,
        )
        .bind(id)
        .bind(tenant.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Contexts of this tenant, oldest first.
    pub async fn list_contexts(
        &self,
        tenant: &Tenant,
        page: Page,
    ) -> StoreResult<PageResult<AiContext>> {
        page.validate(self.max_page_size)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_context WHERE tenant_id = ?")
            .bind(tenant.id())
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed(QueryKey::ListContexts))?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM ai_context WHERE tenant_id = ? \
             ORDER BY creation_date ASC, rowid ASC LIMIT ? OFFSET ?",
            CONTEXT_COLUMNS
        ))
        .bind(tenant.id())
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed(QueryKey::ListContexts))?;

        let stream = rows
            .iter()
            .map(context_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(tenant = %tenant, total, returned = stream.len(), "contexts listed");
        Ok(PageResult {
            number: page.number,
            size: page.size,
            total_elements: total,
            stream,
        })
    }

    async fn dependents(&self, tenant: &Tenant, id: &str) -> StoreResult<Dependents> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ai_knowledge_document WHERE context_id = ?1 AND tenant_id = ?2) AS documents,
                (SELECT COUNT(*) FROM ai_knowledge_url WHERE context_id = ?1 AND tenant_id = ?2) AS urls,
                (SELECT COUNT(*) FROM ai_knowledge_vdb WHERE context_id = ?1 AND tenant_id = ?2) AS bindings
            "#,
        )
        .bind(id)
        .bind(tenant.id())
        .fetch_one(&self.pool)
        .await?;

        Ok(Dependents {
            documents: row.try_get("documents")?,
            urls: row.try_get("urls")?,
            bindings: row.try_get("bindings")?,
        })
    }
}

#[derive(Debug, Default)]
struct Dependents {
    documents: i64,
    urls: i64,
    bindings: i64,
}

impl Dependents {
    fn is_empty(&self) -> bool {
        self.documents == 0 && self.urls == 0 && self.bindings == 0
    }
}

fn context_from_row(row: &SqliteRow) -> Result<AiContext, sqlx::Error> {
    Ok(AiContext {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        trace: trace_from_row(row)?,
    })
}
