//! # AI Context CLI (`aictx`)
//!
//! The `aictx` binary manages AI contexts, their knowledge sources and vector
//! bindings, dispatches generation requests to the configured LLM backend,
//! and starts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! aictx --config ./config/aictx.toml --tenant <tenant> <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aictx init` | Create the SQLite database and run schema migrations |
//! | `aictx serve` | Start the HTTP API |
//! | `aictx context <action>` | Create, list, get, rename, or delete contexts |
//! | `aictx document <action>` | Register, inspect, advance, or delete documents |
//! | `aictx url <action>` | Register, inspect, advance, or delete URLs |
//! | `aictx vdb <action>` | Bind, inspect, or unbind a context's vector store |
//! | `aictx generate "<prompt>"` | Send a prompt to the LLM backend |
//! | `aictx chat --message user=...` | Send a message history to the LLM backend |
//!
//! ## Examples
//!
//! ```bash
//! aictx init
//! aictx --tenant acme context create "Support KB"
//! aictx --tenant acme document add <context-id> faq.md blob-faq
//! aictx --tenant acme document status <document-id> EMBEDDED
//! aictx --tenant acme vdb bind <context-id> qdrant acme-support
//! aictx --tenant acme generate "Summarize our refund policy" --context <context-id>
//! ```

use ai_context::commands;
use ai_context::config;
use ai_context::llm::ModelParams;
use ai_context::migrate;
use ai_context::models::{IngestionStatus, KnowledgeFilter, Tenant};
use ai_context::server;
use ai_context::vector_binding::BindingSpec;
use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// AI Context: tenant-scoped registry of AI contexts and knowledge sources,
/// with a generation dispatcher in front of an LLM backend.
#[derive(Parser)]
#[command(name = "aictx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/aictx.toml")]
    config: PathBuf,

    /// Log level: trace, debug, info, warn, or error. `RUST_LOG` overrides it.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Tenant every data command is scoped to.
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Acting user recorded in modification metadata.
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Manage AI contexts.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Manage knowledge documents.
    Document {
        #[command(subcommand)]
        action: DocumentAction,
    },

    /// Manage knowledge URLs.
    Url {
        #[command(subcommand)]
        action: UrlAction,
    },

    /// Manage a context's vector store binding.
    Vdb {
        #[command(subcommand)]
        action: VdbAction,
    },

    /// Send a single prompt to the LLM backend.
    Generate {
        prompt: String,

        /// Context whose vector binding the backend may retrieve from.
        #[arg(long)]
        context: Option<String>,

        #[command(flatten)]
        params: ModelArgs,
    },

    /// Send a message history to the LLM backend.
    Chat {
        /// Message as `role=content`; repeat in conversation order.
        #[arg(long = "message", required = true, value_parser = parse_key_val)]
        messages: Vec<(String, String)>,

        #[arg(long)]
        context: Option<String>,

        #[command(flatten)]
        params: ModelArgs,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    Get {
        id: String,
    },
    /// Change a context's name and description.
    Rename {
        id: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a context. Fails while documents, URLs, or a binding remain.
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum DocumentAction {
    /// Register a document in a context with status NEW.
    Add {
        context_id: String,
        name: String,
        /// Handle to the raw content in external storage.
        document_ref_id: String,
    },
    Get {
        id: String,
    },
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Advance ingestion status (NEW, PROCESSING, EMBEDDED).
    Status {
        id: String,
        status: IngestionStatus,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum UrlAction {
    /// Register a URL in a context with status NEW.
    Add {
        context_id: String,
        name: String,
        url: String,
        #[arg(long)]
        description: Option<String>,
    },
    Get {
        id: String,
    },
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    Status {
        id: String,
        status: IngestionStatus,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum VdbAction {
    /// Bind a context to a vector store collection, replacing any existing binding.
    Bind {
        context_id: String,
        vdb: String,
        collection: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Get {
        context_id: String,
    },
    Unbind {
        context_id: String,
    },
}

#[derive(Args)]
struct PageArgs {
    /// Zero-based page number.
    #[arg(long, default_value_t = 0)]
    page: u32,
    /// Page size; defaults to `[pagination].default_page_size`.
    #[arg(long)]
    size: Option<u32>,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    status: Option<IngestionStatus>,
    #[arg(long)]
    name_prefix: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> KnowledgeFilter {
        KnowledgeFilter {
            context_id: self.context,
            status: self.status,
            name_prefix: self.name_prefix,
        }
    }
}

#[derive(Args)]
struct ModelArgs {
    /// Override the configured model.
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
}

impl ModelArgs {
    fn into_params(self) -> ModelParams {
        ModelParams {
            model: self.model,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }
}

/// Parse a `key=value` pair for `--message` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid ROLE=CONTENT: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    let tenant = || -> anyhow::Result<Tenant> {
        let id = cli
            .tenant
            .as_deref()
            .context("--tenant is required for this command")?;
        let tenant = Tenant::new(id)?;
        Ok(match cli.user.as_deref() {
            Some(user) => tenant.with_user(user),
            None => tenant,
        })
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Context { action } => {
            let tenant = tenant()?;
            match action {
                ContextAction::Create { name, description } => {
                    commands::run_context_create(&cfg, &tenant, &name, description.as_deref())
                        .await?
                }
                ContextAction::List { page } => {
                    commands::run_context_list(&cfg, &tenant, page.page, page.size).await?
                }
                ContextAction::Get { id } => commands::run_context_get(&cfg, &tenant, &id).await?,
                ContextAction::Rename {
                    id,
                    name,
                    description,
                } => {
                    commands::run_context_rename(
                        &cfg,
                        &tenant,
                        &id,
                        &name,
                        description.as_deref(),
                    )
                    .await?
                }
                ContextAction::Delete { id } => {
                    commands::run_context_delete(&cfg, &tenant, &id).await?
                }
            }
        }
        Commands::Document { action } => {
            let tenant = tenant()?;
            match action {
                DocumentAction::Add {
                    context_id,
                    name,
                    document_ref_id,
                } => {
                    commands::run_document_add(&cfg, &tenant, &context_id, &name, &document_ref_id)
                        .await?
                }
                DocumentAction::Get { id } => {
                    commands::run_document_get(&cfg, &tenant, &id).await?
                }
                DocumentAction::List { filter, page } => {
                    commands::run_document_list(
                        &cfg,
                        &tenant,
                        &filter.into_filter(),
                        page.page,
                        page.size,
                    )
                    .await?
                }
                DocumentAction::Status { id, status } => {
                    commands::run_document_status(&cfg, &tenant, &id, status).await?
                }
                DocumentAction::Delete { id } => {
                    commands::run_document_delete(&cfg, &tenant, &id).await?
                }
            }
        }
        Commands::Url { action } => {
            let tenant = tenant()?;
            match action {
                UrlAction::Add {
                    context_id,
                    name,
                    url,
                    description,
                } => {
                    commands::run_url_add(
                        &cfg,
                        &tenant,
                        &context_id,
                        &name,
                        description.as_deref(),
                        &url,
                    )
                    .await?
                }
                UrlAction::Get { id } => commands::run_url_get(&cfg, &tenant, &id).await?,
                UrlAction::List { filter, page } => {
                    commands::run_url_list(
                        &cfg,
                        &tenant,
                        &filter.into_filter(),
                        page.page,
                        page.size,
                    )
                    .await?
                }
                UrlAction::Status { id, status } => {
                    commands::run_url_status(&cfg, &tenant, &id, status).await?
                }
                UrlAction::Delete { id } => commands::run_url_delete(&cfg, &tenant, &id).await?,
            }
        }
        Commands::Vdb { action } => {
            let tenant = tenant()?;
            match action {
                VdbAction::Bind {
                    context_id,
                    vdb,
                    collection,
                    name,
                    description,
                } => {
                    let spec = BindingSpec {
                        vdb: &vdb,
                        vdb_collection: &collection,
                        name: name.as_deref(),
                        description: description.as_deref(),
                    };
                    commands::run_vdb_bind(&cfg, &tenant, &context_id, spec).await?
                }
                VdbAction::Get { context_id } => {
                    commands::run_vdb_get(&cfg, &tenant, &context_id).await?
                }
                VdbAction::Unbind { context_id } => {
                    commands::run_vdb_unbind(&cfg, &tenant, &context_id).await?
                }
            }
        }
        Commands::Generate {
            prompt,
            context,
            params,
        } => {
            let tenant = tenant()?;
            commands::run_generate(&cfg, &tenant, prompt, context, params.into_params()).await?;
        }
        Commands::Chat {
            messages,
            context,
            params,
        } => {
            let tenant = tenant()?;
            commands::run_chat(&cfg, &tenant, messages, context, params.into_params()).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so command output on stdout stays clean.
fn setup_logging(log_level: &Option<String>) {
    let level = match log_level.as_deref().unwrap_or("warn").to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sqlx=warn,{}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}
