use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Contexts. UNIQUE(id, tenant_id) is the target of the composite
    // foreign keys below, which pin every child row to its owner's tenant.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_context (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            creation_date INTEGER NOT NULL,
            creation_user TEXT NOT NULL,
            modification_date INTEGER NOT NULL,
            modification_user TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            UNIQUE(id, tenant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_knowledge_document (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            doc_ref_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('NEW', 'PROCESSING', 'EMBEDDED')),
            context_id TEXT NOT NULL,
            creation_date INTEGER NOT NULL,
            creation_user TEXT NOT NULL,
            modification_date INTEGER NOT NULL,
            modification_user TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (context_id, tenant_id) REFERENCES ai_context(id, tenant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_knowledge_url (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            url TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('NEW', 'PROCESSING', 'EMBEDDED')),
            context_id TEXT NOT NULL,
            creation_date INTEGER NOT NULL,
            creation_user TEXT NOT NULL,
            modification_date INTEGER NOT NULL,
            modification_user TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (context_id, tenant_id) REFERENCES ai_context(id, tenant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One binding per context: context_id is UNIQUE.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_knowledge_vdb (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT,
            description TEXT,
            vdb TEXT NOT NULL,
            vdb_collection TEXT NOT NULL,
            context_id TEXT NOT NULL UNIQUE,
            creation_date INTEGER NOT NULL,
            creation_user TEXT NOT NULL,
            modification_date INTEGER NOT NULL,
            modification_user TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (context_id, tenant_id) REFERENCES ai_context(id, tenant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_context_tenant ON ai_context(tenant_id, creation_date)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_tenant_context ON ai_knowledge_document(tenant_id, context_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_tenant_status ON ai_knowledge_document(tenant_id, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_url_tenant_context ON ai_knowledge_url(tenant_id, context_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
