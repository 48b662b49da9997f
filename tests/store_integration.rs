//! Store-level tests against a real SQLite database in a temp directory.

use ai_context::config::Config;
use ai_context::db;
use ai_context::error::{QueryKey, StoreError};
use ai_context::migrate;
use ai_context::models::{IngestionStatus, KnowledgeFilter, Page, Tenant};
use ai_context::store::Stores;
use ai_context::vector_binding::BindingSpec;
use sqlx::SqlitePool;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{}"

[pagination]
default_page_size = 10
max_page_size = 50
"#,
        tmp.path().join("aictx.sqlite").display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn setup() -> (TempDir, SqlitePool, Stores) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let stores = Stores::new(pool.clone(), &cfg);
    (tmp, pool, stores)
}

fn tenant(id: &str) -> Tenant {
    Tenant::new(id).unwrap()
}

fn qdrant<'a>(collection: &'a str) -> BindingSpec<'a> {
    BindingSpec {
        vdb: "qdrant",
        vdb_collection: collection,
        name: None,
        description: None,
    }
}

// ============ Contexts ============

#[tokio::test]
async fn test_context_create_get_rename() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme").with_user("alice");

    let ctx = stores.contexts.create_context(&acme, "Support KB").await.unwrap();
    assert_eq!(ctx.tenant_id, "acme");
    assert_eq!(ctx.name, "Support KB");
    assert_eq!(ctx.trace.version, 0);
    assert_eq!(ctx.trace.creation_user, "alice");

    let fetched = stores.contexts.get_context(&acme, &ctx.id).await.unwrap();
    assert_eq!(fetched, ctx);

    let bob = tenant("acme").with_user("bob");
    let renamed = stores
        .contexts
        .rename_context(&bob, &ctx.id, "Support", Some("customer-facing"))
        .await
        .unwrap();
    assert_eq!(renamed.name, "Support");
    assert_eq!(renamed.description.as_deref(), Some("customer-facing"));
    assert_eq!(renamed.trace.version, 1);
    assert_eq!(renamed.trace.creation_user, "alice");
    assert_eq!(renamed.trace.modification_user, "bob");
    assert!(renamed.trace.modification_date >= ctx.trace.modification_date);
}

#[tokio::test]
async fn test_context_blank_name_rejected() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");

    let err = stores.contexts.create_context(&acme, "   ").await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);

    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    let err = stores
        .contexts
        .rename_context(&acme, &ctx.id, "", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_list_contexts_in_creation_order() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");

    for name in ["first", "second", "third"] {
        stores.contexts.create_context(&acme, name).await.unwrap();
    }

    let page = stores
        .contexts
        .list_contexts(&acme, Page::first(10))
        .await
        .unwrap();
    let names: Vec<&str> = page.stream.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    assert_eq!(page.total_elements, 3);

    let second_page = stores
        .contexts
        .list_contexts(&acme, Page::new(1, 2))
        .await
        .unwrap();
    assert_eq!(second_page.stream.len(), 1);
    assert_eq!(second_page.stream[0].name, "third");
    assert_eq!(second_page.total_elements, 3);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let globex = tenant("globex");

    let ctx = stores.contexts.create_context(&acme, "Private").await.unwrap();
    let doc = stores
        .knowledge
        .add_document(&acme, &ctx.id, "plan.pdf", "blob-1")
        .await
        .unwrap();

    assert!(stores
        .contexts
        .get_context(&globex, &ctx.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(stores
        .knowledge
        .get_document(&globex, &doc.id)
        .await
        .unwrap_err()
        .is_not_found());

    let listed = stores
        .contexts
        .list_contexts(&globex, Page::first(10))
        .await
        .unwrap();
    assert_eq!(listed.total_elements, 0);

    let found = stores
        .knowledge
        .find_documents(&globex, &KnowledgeFilter::default(), Page::first(10))
        .await
        .unwrap();
    assert!(found.stream.is_empty());

    // Another tenant cannot attach to, bind, advance, or delete acme's records.
    assert!(stores
        .knowledge
        .add_document(&globex, &ctx.id, "x", "blob-2")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(stores
        .bindings
        .bind_vector_store(&globex, &ctx.id, qdrant("c"))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(stores
        .knowledge
        .advance_document_status(&globex, &doc.id, IngestionStatus::Embedded)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(stores
        .knowledge
        .delete_document(&globex, &doc.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(stores
        .contexts
        .delete_context(&globex, &ctx.id)
        .await
        .unwrap_err()
        .is_not_found());

    let still_new = stores.knowledge.get_document(&acme, &doc.id).await.unwrap();
    assert_eq!(still_new.status, IngestionStatus::New);
}

#[tokio::test]
async fn test_delete_context_with_dependents_conflicts() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");

    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    let doc = stores
        .knowledge
        .add_document(&acme, &ctx.id, "a.pdf", "blob-a")
        .await
        .unwrap();
    stores
        .bindings
        .bind_vector_store(&acme, &ctx.id, qdrant("kb"))
        .await
        .unwrap();

    let err = stores.contexts.delete_context(&acme, &ctx.id).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "{:?}", err);
    assert!(err.to_string().contains("1 document(s)"), "{}", err);

    // Nothing was removed.
    stores.knowledge.get_document(&acme, &doc.id).await.unwrap();
    stores.contexts.get_context(&acme, &ctx.id).await.unwrap();

    stores.knowledge.delete_document(&acme, &doc.id).await.unwrap();
    stores.bindings.unbind(&acme, &ctx.id).await.unwrap();
    stores.contexts.delete_context(&acme, &ctx.id).await.unwrap();

    let again = stores.contexts.delete_context(&acme, &ctx.id).await.unwrap_err();
    assert!(again.is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_document_racing_delete_context_has_one_winner() {
    let (_tmp, pool, stores) = setup().await;
    let acme = tenant("acme");

    for round in 0..50 {
        let ctx = stores.contexts.create_context(&acme, "Racy").await.unwrap();

        let adder = {
            let stores = stores.clone();
            let acme = acme.clone();
            let ctx_id = ctx.id.clone();
            tokio::spawn(async move {
                stores
                    .knowledge
                    .add_document(&acme, &ctx_id, "late.pdf", "blob-late")
                    .await
            })
        };
        let deleter = {
            let stores = stores.clone();
            let acme = acme.clone();
            let ctx_id = ctx.id.clone();
            tokio::spawn(async move { stores.contexts.delete_context(&acme, &ctx_id).await })
        };
        let added = adder.await.unwrap();
        let deleted = deleter.await.unwrap();

        match (&added, &deleted) {
            (Ok(_), Err(StoreError::Conflict(_))) => {
                let doc = added.as_ref().unwrap();
                stores.knowledge.delete_document(&acme, &doc.id).await.unwrap();
                stores.contexts.delete_context(&acme, &ctx.id).await.unwrap();
            }
            (Err(e), Ok(())) if e.is_not_found() => {}
            other => panic!("round {}: expected exactly one winner, got {:?}", round, other),
        }
    }

    let orphans: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ai_knowledge_document d \
         WHERE NOT EXISTS (SELECT 1 FROM ai_context c WHERE c.id = d.context_id)",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn test_foreign_keys_reject_rows_without_context() {
    let (_tmp, pool, _stores) = setup().await;

    let err = sqlx::query(
        r#"
        INSERT INTO ai_knowledge_document (id, tenant_id, name, doc_ref_id, status, context_id,
                                           creation_date, creation_user,
                                           modification_date, modification_user, version)
        VALUES ('d1', 'acme', 'x', 'blob', 'NEW', 'gone', 0, 'a', 0, 'a', 0)
        "#,
    )
    .execute(&pool)
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("FOREIGN KEY constraint failed"),
        "{}",
        err
    );
}

// ============ Documents ============

#[tokio::test]
async fn test_add_document_to_missing_context_creates_nothing() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");

    let err = stores
        .knowledge
        .add_document(&acme, "no-such-context", "handbook.pdf", "blob-1")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);

    let all = stores
        .knowledge
        .find_documents(&acme, &KnowledgeFilter::default(), Page::first(10))
        .await
        .unwrap();
    assert_eq!(all.total_elements, 0);
}

#[tokio::test]
async fn test_document_status_lifecycle() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();

    let doc = stores
        .knowledge
        .add_document(&acme, &ctx.id, "handbook.pdf", "blob-1")
        .await
        .unwrap();
    assert_eq!(doc.status, IngestionStatus::New);
    assert_eq!(doc.document_ref_id, "blob-1");

    let same = stores
        .knowledge
        .advance_document_status(&acme, &doc.id, IngestionStatus::New)
        .await
        .unwrap_err();
    assert!(matches!(same, StoreError::Conflict(_)), "{:?}", same);

    let processing = stores
        .knowledge
        .advance_document_status(&acme, &doc.id, IngestionStatus::Processing)
        .await
        .unwrap();
    assert_eq!(processing.status, IngestionStatus::Processing);
    assert_eq!(processing.trace.version, 1);

    let embedded = stores
        .knowledge
        .advance_document_status(&acme, &doc.id, IngestionStatus::Embedded)
        .await
        .unwrap();
    assert_eq!(embedded.status, IngestionStatus::Embedded);

    for target in [IngestionStatus::New, IngestionStatus::Processing, IngestionStatus::Embedded] {
        let err = stores
            .knowledge
            .advance_document_status(&acme, &doc.id, target)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{:?} -> {:?}", target, err);
    }

    let unchanged = stores.knowledge.get_document(&acme, &doc.id).await.unwrap();
    assert_eq!(unchanged.status, IngestionStatus::Embedded);
    assert_eq!(unchanged.trace.version, 2);
}

#[tokio::test]
async fn test_processing_may_be_skipped() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    let doc = stores
        .knowledge
        .add_document(&acme, &ctx.id, "quick.txt", "blob-q")
        .await
        .unwrap();

    let embedded = stores
        .knowledge
        .advance_document_status(&acme, &doc.id, IngestionStatus::Embedded)
        .await
        .unwrap();
    assert_eq!(embedded.status, IngestionStatus::Embedded);
}

#[tokio::test]
async fn test_concurrent_advances_apply_once() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    let doc = stores
        .knowledge
        .add_document(&acme, &ctx.id, "race.pdf", "blob-r")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        stores
            .knowledge
            .advance_document_status(&acme, &doc.id, IngestionStatus::Processing),
        stores
            .knowledge
            .advance_document_status(&acme, &doc.id, IngestionStatus::Processing),
    );
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);

    let doc = stores.knowledge.get_document(&acme, &doc.id).await.unwrap();
    assert_eq!(doc.trace.version, 1);
}

#[tokio::test]
async fn test_find_documents_by_status_in_acme() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "Support KB").await.unwrap();

    let faq = stores
        .knowledge
        .add_document(&acme, &ctx.id, "faq.md", "blob-faq")
        .await
        .unwrap();
    stores
        .knowledge
        .add_document(&acme, &ctx.id, "policy.pdf", "blob-policy")
        .await
        .unwrap();
    stores
        .knowledge
        .advance_document_status(&acme, &faq.id, IngestionStatus::Embedded)
        .await
        .unwrap();

    let filter = KnowledgeFilter {
        context_id: Some(ctx.id.clone()),
        status: Some(IngestionStatus::Embedded),
        name_prefix: None,
    };
    let embedded = stores
        .knowledge
        .find_documents(&acme, &filter, Page::first(10))
        .await
        .unwrap();
    assert_eq!(embedded.total_elements, 1);
    assert_eq!(embedded.stream[0].id, faq.id);

    let filter = KnowledgeFilter {
        status: Some(IngestionStatus::New),
        ..Default::default()
    };
    let pending = stores
        .knowledge
        .find_documents(&acme, &filter, Page::first(10))
        .await
        .unwrap();
    assert_eq!(pending.total_elements, 1);
    assert_eq!(pending.stream[0].name, "policy.pdf");
}

#[tokio::test]
async fn test_find_documents_paginates() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    for i in 0..5 {
        stores
            .knowledge
            .add_document(&acme, &ctx.id, &format!("doc-{}", i), &format!("blob-{}", i))
            .await
            .unwrap();
    }

    let filter = KnowledgeFilter::default();
    let last = stores
        .knowledge
        .find_documents(&acme, &filter, Page::new(2, 2))
        .await
        .unwrap();
    assert_eq!(last.total_elements, 5);
    assert_eq!(last.stream.len(), 1);
    assert_eq!(last.stream[0].name, "doc-4");

    let past_end = stores
        .knowledge
        .find_documents(&acme, &filter, Page::new(9, 2))
        .await
        .unwrap();
    assert!(past_end.stream.is_empty());
    assert_eq!(past_end.total_elements, 5);

    for bad in [Page::new(0, 0), Page::new(0, 51)] {
        let err = stores
            .knowledge
            .find_documents(&acme, &filter, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);
    }
}

#[tokio::test]
async fn test_name_prefix_matches_wildcards_literally() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    for name in ["100%_done.pdf", "100xyz.pdf", "report.pdf"] {
        stores
            .knowledge
            .add_document(&acme, &ctx.id, name, "blob")
            .await
            .unwrap();
    }

    let filter = KnowledgeFilter {
        name_prefix: Some("100%".to_string()),
        ..Default::default()
    };
    let found = stores
        .knowledge
        .find_documents(&acme, &filter, Page::first(10))
        .await
        .unwrap();
    assert_eq!(found.total_elements, 1);
    assert_eq!(found.stream[0].name, "100%_done.pdf");

    let filter = KnowledgeFilter {
        name_prefix: Some("100".to_string()),
        ..Default::default()
    };
    let found = stores
        .knowledge
        .find_documents(&acme, &filter, Page::first(10))
        .await
        .unwrap();
    assert_eq!(found.total_elements, 2);
}

#[tokio::test]
async fn test_criteria_query_failure_is_query_error() {
    let (_tmp, pool, stores) = setup().await;
    let acme = tenant("acme");
    pool.close().await;

    let err = stores
        .knowledge
        .find_documents(&acme, &KnowledgeFilter::default(), Page::first(10))
        .await
        .unwrap_err();
    match err {
        StoreError::Query { key, .. } => assert_eq!(key, QueryKey::FindDocumentsByCriteria),
        other => panic!("expected query error, got {:?}", other),
    }

    let err = stores
        .knowledge
        .find_urls(&acme, &KnowledgeFilter::default(), Page::first(10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "query_error");

    let err = stores
        .contexts
        .list_contexts(&acme, Page::first(10))
        .await
        .unwrap_err();
    match err {
        StoreError::Query { key, .. } => assert_eq!(key, QueryKey::ListContexts),
        other => panic!("expected query error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lookup_failure_carries_find_by_id_key() {
    let (_tmp, pool, stores) = setup().await;
    let acme = tenant("acme");
    pool.close().await;

    let errors = [
        stores.contexts.get_context(&acme, "c1").await.unwrap_err(),
        stores.knowledge.get_document(&acme, "d1").await.unwrap_err(),
        stores.knowledge.get_url(&acme, "u1").await.unwrap_err(),
    ];
    for err in errors {
        match err {
            StoreError::Query { key, .. } => assert_eq!(key, QueryKey::FindById),
            other => panic!("expected query error, got {:?}", other),
        }
    }
    assert_eq!(QueryKey::FindById.as_str(), "FIND_ENTITY_BY_ID");
}

// ============ URLs ============

#[tokio::test]
async fn test_url_registration_and_status() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "Web").await.unwrap();

    let url = stores
        .knowledge
        .add_url(
            &acme,
            &ctx.id,
            "Pricing",
            Some("public pricing page"),
            "https://acme.example/pricing",
        )
        .await
        .unwrap();
    assert_eq!(url.status, IngestionStatus::New);
    assert_eq!(url.url, "https://acme.example/pricing");
    assert_eq!(url.description.as_deref(), Some("public pricing page"));

    let advanced = stores
        .knowledge
        .advance_url_status(&acme, &url.id, IngestionStatus::Processing)
        .await
        .unwrap();
    assert_eq!(advanced.status, IngestionStatus::Processing);

    let filter = KnowledgeFilter {
        context_id: Some(ctx.id.clone()),
        ..Default::default()
    };
    let found = stores
        .knowledge
        .find_urls(&acme, &filter, Page::first(10))
        .await
        .unwrap();
    assert_eq!(found.total_elements, 1);

    stores.knowledge.delete_url(&acme, &url.id).await.unwrap();
    assert!(stores
        .knowledge
        .get_url(&acme, &url.id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_invalid_url_rejected() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "Web").await.unwrap();

    for bad in ["", "not a url", "/relative/path", "acme.example/page"] {
        let err = stores
            .knowledge
            .add_url(&acme, &ctx.id, "bad", None, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)), "{:?}: {:?}", bad, err);
    }

    let found = stores
        .knowledge
        .find_urls(&acme, &KnowledgeFilter::default(), Page::first(10))
        .await
        .unwrap();
    assert_eq!(found.total_elements, 0);
}

// ============ Vector bindings ============

#[tokio::test]
async fn test_binding_replaces_in_place() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");
    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();

    assert!(stores
        .bindings
        .get_binding(&acme, &ctx.id)
        .await
        .unwrap()
        .is_none());

    let first = stores
        .bindings
        .bind_vector_store(&acme, &ctx.id, qdrant("kb-v1"))
        .await
        .unwrap();
    assert_eq!(first.vdb_collection, "kb-v1");
    assert_eq!(first.trace.version, 0);

    let spec = BindingSpec {
        vdb: "pgvector",
        vdb_collection: "kb-v2",
        name: Some("primary"),
        description: None,
    };
    let second = stores
        .bindings
        .bind_vector_store(&acme, &ctx.id, spec)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.vdb, "pgvector");
    assert_eq!(second.vdb_collection, "kb-v2");
    assert_eq!(second.name.as_deref(), Some("primary"));
    assert_eq!(second.trace.version, 1);
    assert_eq!(second.trace.creation_date, first.trace.creation_date);

    let current = stores
        .bindings
        .get_binding(&acme, &ctx.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current, second);

    stores.bindings.unbind(&acme, &ctx.id).await.unwrap();
    assert!(stores
        .bindings
        .unbind(&acme, &ctx.id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_binding_requires_context_and_fields() {
    let (_tmp, _pool, stores) = setup().await;
    let acme = tenant("acme");

    let err = stores
        .bindings
        .bind_vector_store(&acme, "missing", qdrant("c"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let ctx = stores.contexts.create_context(&acme, "KB").await.unwrap();
    let spec = BindingSpec {
        vdb: " ",
        vdb_collection: "c",
        name: None,
        description: None,
    };
    let err = stores
        .bindings
        .bind_vector_store(&acme, &ctx.id, spec)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)), "{:?}", err);
}
