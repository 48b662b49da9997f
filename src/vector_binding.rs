//! Vector bindings: the one vector-store collection a context's embeddings
//! are written to and retrieved from.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{is_foreign_key_violation, StoreError, StoreResult};
use crate::models::{Tenant, VectorBinding};
use crate::store::{ensure_context, new_id, non_blank, now_millis, require, trace_from_row};

/// Fields a caller supplies when binding a context to a vector store.
#[derive(Debug, Clone)]
pub struct BindingSpec<'a> {
    pub vdb: &'a str,
    pub vdb_collection: &'a str,
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
}

#[derive(Clone)]
pub struct VectorBindings {
    pool: SqlitePool,
}

impl VectorBindings {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create or replace the binding for `context_id`.
    ///
    /// A replace keeps the binding id and creation metadata and bumps the
    /// version; there is never more than one row per context.
    pub async fn bind_vector_store(
        &self,
        tenant: &Tenant,
        context_id: &str,
        spec: BindingSpec<'_>,
    ) -> StoreResult<VectorBinding> {
        require("vdb", spec.vdb)?;
        require("vdb_collection", spec.vdb_collection)?;
        ensure_context(&self.pool, tenant, context_id).await?;

        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_knowledge_vdb (id, tenant_id, name, description, vdb, vdb_collection,
                                          context_id, creation_date, creation_user,
                                          modification_date, modification_user, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(context_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                vdb = excluded.vdb,
                vdb_collection = excluded.vdb_collection,
                modification_date = excluded.modification_date,
                modification_user = excluded.modification_user,
                version = ai_knowledge_vdb.version + 1
            WHERE ai_knowledge_vdb.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(new_id())
        .bind(tenant.id())
        .bind(non_blank(spec.name))
        .bind(non_blank(spec.description))
        .bind(spec.vdb.trim())
        .bind(spec.vdb_collection.trim())
        .bind(context_id)
        .bind(now)
        .bind(tenant.actor())
        .bind(now)
        .bind(tenant.actor())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::not_found("context", context_id)
            } else {
                StoreError::Database(e)
            }
        })?;

        info!(
            tenant = %tenant,
            context_id,
            vdb = spec.vdb,
            collection = spec.vdb_collection,
            "vector store bound"
        );
        self.get_binding(tenant, context_id)
            .await?
            .ok_or_else(|| StoreError::not_found("vector binding", context_id))
    }

    /// The binding for `context_id`, if one is configured.
    pub async fn get_binding(
        &self,
        tenant: &Tenant,
        context_id: &str,
    ) -> StoreResult<Option<VectorBinding>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, name, description, vdb, vdb_collection, context_id,
                   creation_date, creation_user, modification_date, modification_user, version
            FROM ai_knowledge_vdb
            WHERE context_id = ? AND tenant_id = ?
            "#,
        )
        .bind(context_id)
        .bind(tenant.id())
        .fetch_optional(&self.pool)
        .await?;

        debug!(tenant = %tenant, context_id, found = row.is_some(), "vector binding lookup");
        Ok(row.as_ref().map(binding_from_row).transpose()?)
    }

    pub async fn unbind(&self, tenant: &Tenant, context_id: &str) -> StoreResult<()> {
        let result =
            sqlx::query("DELETE FROM ai_knowledge_vdb WHERE context_id = ? AND tenant_id = ?")
                .bind(context_id)
                .bind(tenant.id())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("vector binding", context_id));
        }
        info!(tenant = %tenant, context_id, "vector store unbound");
        Ok(())
    }
}

fn binding_from_row(row: &SqliteRow) -> Result<VectorBinding, sqlx::Error> {
    Ok(VectorBinding {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        vdb: row.try_get("vdb")?,
        vdb_collection: row.try_get("vdb_collection")?,
        context_id: row.try_get("context_id")?,
        trace: trace_from_row(row)?,
    })
}
