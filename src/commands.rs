//! CLI entry points for the data commands.
//!
//! Each `run_*` function opens the pool, performs one store or dispatcher
//! operation for the given tenant, closes the pool, and prints the result to
//! stdout. Errors propagate to `main`, which prints them and exits non-zero.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::dispatch::{ChatRequest, Dispatcher, GenerateRequest};
use crate::llm::{create_backend, ChatMessage, ChatRole, ModelParams};
use crate::models::{
    AiContext, IngestionStatus, KnowledgeDocument, KnowledgeFilter, KnowledgeUrl, Page, Tenant,
    Traceable, VectorBinding,
};
use crate::store::Stores;
use crate::vector_binding::BindingSpec;

async fn open(config: &Config) -> Result<(SqlitePool, Stores)> {
    let pool = db::connect(config).await?;
    let stores = Stores::new(pool.clone(), config);
    Ok((pool, stores))
}

fn page(config: &Config, number: u32, size: Option<u32>) -> Page {
    Page::new(number, size.unwrap_or(config.pagination.default_page_size))
}

// ============ Contexts ============

pub async fn run_context_create(
    config: &Config,
    tenant: &Tenant,
    name: &str,
    description: Option<&str>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .contexts
        .create_context_with_description(tenant, name, description)
        .await;
    pool.close().await;

    print_context(&result?);
    Ok(())
}

pub async fn run_context_get(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.contexts.get_context(tenant, id).await;
    pool.close().await;

    print_context(&result?);
    Ok(())
}

pub async fn run_context_list(
    config: &Config,
    tenant: &Tenant,
    number: u32,
    size: Option<u32>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .contexts
        .list_contexts(tenant, page(config, number, size))
        .await;
    pool.close().await;
    let result = result?;

    if result.stream.is_empty() {
        println!("No contexts.");
        return Ok(());
    }
    for ctx in &result.stream {
        println!("{}  {}", ctx.id, ctx.name);
    }
    println!();
    println!(
        "page {} (size {}), {} total",
        result.number, result.size, result.total_elements
    );
    Ok(())
}

pub async fn run_context_rename(
    config: &Config,
    tenant: &Tenant,
    id: &str,
    name: &str,
    description: Option<&str>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .contexts
        .rename_context(tenant, id, name, description)
        .await;
    pool.close().await;

    print_context(&result?);
    Ok(())
}

pub async fn run_context_delete(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.contexts.delete_context(tenant, id).await;
    pool.close().await;

    result?;
    println!("Deleted context {}", id);
    Ok(())
}

// ============ Documents ============

pub async fn run_document_add(
    config: &Config,
    tenant: &Tenant,
    context_id: &str,
    name: &str,
    document_ref_id: &str,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .knowledge
        .add_document(tenant, context_id, name, document_ref_id)
        .await;
    pool.close().await;

    print_document(&result?);
    Ok(())
}

pub async fn run_document_get(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.knowledge.get_document(tenant, id).await;
    pool.close().await;

    print_document(&result?);
    Ok(())
}

pub async fn run_document_list(
    config: &Config,
    tenant: &Tenant,
    filter: &KnowledgeFilter,
    number: u32,
    size: Option<u32>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .knowledge
        .find_documents(tenant, filter, page(config, number, size))
        .await;
    pool.close().await;
    let result = result?;

    if result.stream.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in &result.stream {
        println!(
            "{}  {:<10}  {}  (ref {})",
            doc.id, doc.status, doc.name, doc.document_ref_id
        );
    }
    println!();
    println!(
        "page {} (size {}), {} total",
        result.number, result.size, result.total_elements
    );
    Ok(())
}

pub async fn run_document_status(
    config: &Config,
    tenant: &Tenant,
    id: &str,
    status: IngestionStatus,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .knowledge
        .advance_document_status(tenant, id, status)
        .await;
    pool.close().await;

    print_document(&result?);
    Ok(())
}

pub async fn run_document_delete(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.knowledge.delete_document(tenant, id).await;
    pool.close().await;

    result?;
    println!("Deleted document {}", id);
    Ok(())
}

// ============ URLs ============

pub async fn run_url_add(
    config: &Config,
    tenant: &Tenant,
    context_id: &str,
    name: &str,
    description: Option<&str>,
    url: &str,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .knowledge
        .add_url(tenant, context_id, name, description, url)
        .await;
    pool.close().await;

    print_url(&result?);
    Ok(())
}

pub async fn run_url_get(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.knowledge.get_url(tenant, id).await;
    pool.close().await;

    print_url(&result?);
    Ok(())
}

pub async fn run_url_list(
    config: &Config,
    tenant: &Tenant,
    filter: &KnowledgeFilter,
    number: u32,
    size: Option<u32>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .knowledge
        .find_urls(tenant, filter, page(config, number, size))
        .await;
    pool.close().await;
    let result = result?;

    if result.stream.is_empty() {
        println!("No URLs.");
        return Ok(());
    }
    for url in &result.stream {
        println!("{}  {:<10}  {}  {}", url.id, url.status, url.name, url.url);
    }
    println!();
    println!(
        "page {} (size {}), {} total",
        result.number, result.size, result.total_elements
    );
    Ok(())
}

pub async fn run_url_status(
    config: &Config,
    tenant: &Tenant,
    id: &str,
    status: IngestionStatus,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.knowledge.advance_url_status(tenant, id, status).await;
    pool.close().await;

    print_url(&result?);
    Ok(())
}

pub async fn run_url_delete(config: &Config, tenant: &Tenant, id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.knowledge.delete_url(tenant, id).await;
    pool.close().await;

    result?;
    println!("Deleted URL {}", id);
    Ok(())
}

// ============ Vector bindings ============

pub async fn run_vdb_bind(
    config: &Config,
    tenant: &Tenant,
    context_id: &str,
    spec: BindingSpec<'_>,
) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores
        .bindings
        .bind_vector_store(tenant, context_id, spec)
        .await;
    pool.close().await;

    print_binding(&result?);
    Ok(())
}

pub async fn run_vdb_get(config: &Config, tenant: &Tenant, context_id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = async {
        stores.contexts.get_context(tenant, context_id).await?;
        stores.bindings.get_binding(tenant, context_id).await
    }
    .await;
    pool.close().await;

    match result? {
        Some(binding) => print_binding(&binding),
        None => println!("No vector store bound to context {}", context_id),
    }
    Ok(())
}

pub async fn run_vdb_unbind(config: &Config, tenant: &Tenant, context_id: &str) -> Result<()> {
    let (pool, stores) = open(config).await?;
    let result = stores.bindings.unbind(tenant, context_id).await;
    pool.close().await;

    result?;
    println!("Unbound vector store from context {}", context_id);
    Ok(())
}

// ============ Generation ============

pub async fn run_generate(
    config: &Config,
    tenant: &Tenant,
    prompt: String,
    context_id: Option<String>,
    model_params: ModelParams,
) -> Result<()> {
    let backend = create_backend(&config.llm)?;
    let (pool, stores) = open(config).await?;
    let dispatcher = Dispatcher::from_stores(backend, &stores);

    let request = GenerateRequest {
        prompt,
        model_params,
        context_id,
    };
    let result = dispatcher.generate(tenant, request).await;
    pool.close().await;
    let result = result?;

    println!("{}", result.content);
    println!();
    println!(
        "--- {} | finish: {} | tokens: {} prompt, {} completion ---",
        result.model,
        result.finish_reason,
        result.usage.prompt_tokens,
        result.usage.completion_tokens
    );
    Ok(())
}

/// `messages` are `(role, content)` pairs from repeated `--message role=content`.
pub async fn run_chat(
    config: &Config,
    tenant: &Tenant,
    messages: Vec<(String, String)>,
    context_id: Option<String>,
    model_params: ModelParams,
) -> Result<()> {
    let messages = messages
        .into_iter()
        .map(|(role, content)| Ok(ChatMessage::new(parse_role(&role)?, content)))
        .collect::<Result<Vec<_>>>()?;

    let backend = create_backend(&config.llm)?;
    let (pool, stores) = open(config).await?;
    let dispatcher = Dispatcher::from_stores(backend, &stores);

    let request = ChatRequest {
        messages,
        model_params,
        context_id,
    };
    let result = dispatcher.chat(tenant, request).await;
    pool.close().await;
    let result = result?;

    println!("{}", result.message.content);
    println!();
    println!(
        "--- {} | finish: {} | tokens: {} ---",
        result.model,
        result.finish_reason,
        result.usage.total_tokens()
    );
    Ok(())
}

fn parse_role(role: &str) -> Result<ChatRole> {
    match role.trim().to_ascii_lowercase().as_str() {
        "system" => Ok(ChatRole::System),
        "user" => Ok(ChatRole::User),
        "assistant" => Ok(ChatRole::Assistant),
        "tool" => Ok(ChatRole::Tool),
        other => bail!(
            "unknown chat role '{}' (expected system, user, assistant, or tool)",
            other
        ),
    }
}

// ============ Output ============

fn print_context(ctx: &AiContext) {
    println!("--- Context ---");
    println!("id:           {}", ctx.id);
    println!("name:         {}", ctx.name);
    if let Some(ref description) = ctx.description {
        println!("description:  {}", description);
    }
    print_trace(&ctx.trace);
}

fn print_document(doc: &KnowledgeDocument) {
    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("name:         {}", doc.name);
    println!("document_ref: {}", doc.document_ref_id);
    println!("status:       {}", doc.status);
    println!("context_id:   {}", doc.context_id);
    print_trace(&doc.trace);
}

fn print_url(url: &KnowledgeUrl) {
    println!("--- URL ---");
    println!("id:           {}", url.id);
    println!("name:         {}", url.name);
    println!("url:          {}", url.url);
    if let Some(ref description) = url.description {
        println!("description:  {}", description);
    }
    println!("status:       {}", url.status);
    println!("context_id:   {}", url.context_id);
    print_trace(&url.trace);
}

fn print_binding(binding: &VectorBinding) {
    println!("--- Vector Binding ---");
    println!("id:           {}", binding.id);
    println!("context_id:   {}", binding.context_id);
    println!("vdb:          {}", binding.vdb);
    println!("collection:   {}", binding.vdb_collection);
    if let Some(ref name) = binding.name {
        println!("name:         {}", name);
    }
    if let Some(ref description) = binding.description {
        println!("description:  {}", description);
    }
    print_trace(&binding.trace);
}

fn print_trace(trace: &Traceable) {
    println!(
        "created:      {} by {}",
        format_ts_iso(trace.creation_date),
        trace.creation_user
    );
    println!(
        "modified:     {} by {}",
        format_ts_iso(trace.modification_date),
        trace.modification_user
    );
    println!("version:      {}", trace.version);
}

fn format_ts_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("User").unwrap(), ChatRole::User);
        assert_eq!(parse_role(" system ").unwrap(), ChatRole::System);
        assert!(parse_role("wizard").is_err());
    }

    #[test]
    fn test_format_ts_iso_millis() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_ts_iso(1_500), "1970-01-01T00:00:01.500Z");
    }
}
