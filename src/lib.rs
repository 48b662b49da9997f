//! # AI Context
//!
//! A tenant-scoped registry of AI contexts, the knowledge sources attached
//! to them, and the vector store each context is bound to, fronted by a
//! dispatcher that forwards generation requests to an LLM backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐
//! │   CLI    │   │   HTTP   │
//! │ (aictx)  │   │  (axum)  │
//! └────┬─────┘   └────┬─────┘
//!      └──────┬───────┘
//!             ▼
//!   ┌──────────────────┐      ┌─────────────┐
//!   │  Stores          │      │ Dispatcher  │──▶ LLM backend (Ollama)
//!   │  contexts        │◀─────│ generate    │
//!   │  knowledge       │      │ chat        │
//!   │  vector bindings │      └─────────────┘
//!   └────────┬─────────┘
//!            ▼
//!        ┌────────┐
//!        │ SQLite │
//!        └────────┘
//! ```
//!
//! Every store operation takes a [`models::Tenant`]; records of one tenant
//! are invisible to every other.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, ingestion status, pagination |
//! | [`error`] | Store and dispatch error kinds |
//! | [`store`] | Shared store plumbing |
//! | [`context_store`] | AI contexts |
//! | [`knowledge`] | Knowledge documents and URLs |
//! | [`vector_binding`] | Context to vector store bindings |
//! | [`llm`] | LLM backend abstraction |
//! | [`dispatch`] | Generation dispatcher |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod commands;
pub mod config;
pub mod context_store;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod server;
pub mod store;
pub mod vector_binding;
