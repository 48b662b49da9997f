//! Error types for the store, registry, and dispatcher.
//!
//! Every failure keeps a distinguishable kind so callers (and the HTTP
//! layer) can branch on it:
//!
//! | Kind | Code | Raised by |
//! |------|------|-----------|
//! | [`StoreError::NotFound`] | `not_found` | any lookup by tenant + id |
//! | [`StoreError::Validation`] | `validation_error` | bad names, URLs, pagination |
//! | [`StoreError::Conflict`] | `conflict` | illegal status transition, blocked delete |
//! | [`StoreError::Query`] | `query_error` | lookup, criteria, or list query could not execute |
//! | [`DispatchError::BackendUnavailable`] | `backend_unavailable` | LLM backend down |
//! | [`DispatchError::BackendTimeout`] | `backend_timeout` | LLM backend too slow |
//! | [`DispatchError::InvalidRequest`] | `invalid_request` | malformed prompt/messages |

use std::fmt;
use thiserror::Error;

/// Operation key attached to a [`StoreError::Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKey {
    /// Lookup of one record by tenant and id.
    FindById,
    ListContexts,
    FindDocumentsByCriteria,
    FindUrlsByCriteria,
}

impl QueryKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKey::FindById => "FIND_ENTITY_BY_ID",
            QueryKey::ListContexts => "LIST_CONTEXTS",
            QueryKey::FindDocumentsByCriteria => "FIND_DOCUMENTS_BY_CRITERIA",
            QueryKey::FindUrlsByCriteria => "FIND_URLS_BY_CRITERIA",
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the context store, knowledge registry, and vector bindings.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row matches the id within the caller's tenant.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not execute a lookup, list, or criteria query.
    /// Distinct from an empty result.
    #[error("query {key} failed: {source}")]
    Query {
        key: QueryKey,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        StoreError::Conflict(message.into())
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Validation(_) => "validation_error",
            StoreError::Conflict(_) => "conflict",
            StoreError::Query { .. } => "query_error",
            StoreError::Database(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Wrap a sqlx error from a criteria query with its operation key.
pub(crate) fn query_failed(key: QueryKey) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { key, source }
}

/// True when SQLite rejected a write because a foreign key did not resolve.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("FOREIGN KEY constraint failed"),
        _ => false,
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the generation dispatcher and LLM backends.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("LLM backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("LLM backend timed out: {0}")]
    BackendTimeout(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Context lookup failed before the backend was called.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::BackendUnavailable(_) => "backend_unavailable",
            DispatchError::BackendTimeout(_) => "backend_timeout",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Store(e) => e.code(),
        }
    }

    /// Failures worth retrying when retries are configured.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::BackendUnavailable(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
