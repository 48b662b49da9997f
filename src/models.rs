//! Core data models: contexts, knowledge sources, vector bindings, and the
//! tenant scope every operation runs under.
//!
//! Relationships are plain id fields. Nothing here loads related rows;
//! callers fetch them through the store that owns them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Actor recorded when a caller does not identify a user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// The tenant (and optional acting user) a request runs under.
///
/// Resolved once per request by the caller and passed explicitly into every
/// store, registry, and dispatcher call. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    id: String,
    user: Option<String>,
}

impl Tenant {
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(StoreError::validation("tenant id must not be empty"));
        }
        Ok(Self { id, user: None })
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.user = if user.trim().is_empty() {
            None
        } else {
            Some(user)
        };
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actor written into creation/modification metadata.
    pub fn actor(&self) -> &str {
        self.user.as_deref().unwrap_or(ANONYMOUS_USER)
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Creation/modification metadata shared by every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traceable {
    /// Epoch milliseconds.
    pub creation_date: i64,
    pub creation_user: String,
    /// Epoch milliseconds.
    pub modification_date: i64,
    pub modification_user: String,
    /// Optimistic-lock counter, bumped on every update.
    pub version: i64,
}

/// Ingestion state of a knowledge document or URL.
///
/// ```text
/// NEW ──► PROCESSING ──► EMBEDDED (terminal)
///  └─────────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    New,
    Processing,
    Embedded,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::New => "NEW",
            IngestionStatus::Processing => "PROCESSING",
            IngestionStatus::Embedded => "EMBEDDED",
        }
    }

    /// States from which `self` may be entered. Forward-only: PROCESSING may
    /// be skipped, nothing leaves EMBEDDED, and repeating the current state
    /// is not a transition.
    pub fn predecessors(&self) -> &'static [IngestionStatus] {
        match self {
            IngestionStatus::New => &[],
            IngestionStatus::Processing => &[IngestionStatus::New],
            IngestionStatus::Embedded => &[IngestionStatus::New, IngestionStatus::Processing],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionStatus::Embedded)
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(IngestionStatus::New),
            "PROCESSING" => Ok(IngestionStatus::Processing),
            "EMBEDDED" => Ok(IngestionStatus::Embedded),
            other => Err(StoreError::validation(format!(
                "unknown status '{}': expected NEW, PROCESSING or EMBEDDED",
                other
            ))),
        }
    }
}

/// A tenant-scoped grouping of knowledge sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AiContext {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub trace: Traceable,
}

/// A single document registered for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Opaque handle to the raw content in external storage.
    pub document_ref_id: String,
    pub status: IngestionStatus,
    pub context_id: String,
    #[serde(flatten)]
    pub trace: Traceable,
}

/// A web resource registered for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeUrl {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub status: IngestionStatus,
    pub context_id: String,
    #[serde(flatten)]
    pub trace: Traceable,
}

/// The vector-store collection a context's embeddings live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VectorBinding {
    pub id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub vdb: String,
    pub vdb_collection: String,
    pub context_id: String,
    #[serde(flatten)]
    pub trace: Traceable,
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub fn new(number: u32, size: u32) -> Self {
        Self { number, size }
    }

    pub fn first(size: u32) -> Self {
        Self { number: 0, size }
    }

    pub fn validate(&self, max_size: u32) -> Result<(), StoreError> {
        if self.size == 0 {
            return Err(StoreError::validation("page size must be >= 1"));
        }
        if self.size > max_size {
            return Err(StoreError::validation(format!(
                "page size {} exceeds maximum {}",
                self.size, max_size
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.number) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub number: u32,
    pub size: u32,
    pub total_elements: i64,
    pub stream: Vec<T>,
}

/// Optional filters for knowledge source lookups. Absent fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeFilter {
    pub context_id: Option<String>,
    pub status: Option<IngestionStatus>,
    pub name_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use IngestionStatus::*;
        assert_eq!(Processing.predecessors(), &[New]);
        assert_eq!(Embedded.predecessors(), &[New, Processing]);
    }

    #[test]
    fn test_backward_and_repeat_transitions_rejected() {
        use IngestionStatus::*;
        for (from, to) in [
            (Embedded, New),
            (Embedded, Processing),
            (Processing, New),
            (New, New),
            (Processing, Processing),
            (Embedded, Embedded),
        ] {
            assert!(
                !to.predecessors().contains(&from),
                "{} -> {} must be rejected",
                from,
                to
            );
        }
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(
            "embedded".parse::<IngestionStatus>().unwrap(),
            IngestionStatus::Embedded
        );
        assert!("DONE".parse::<IngestionStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&IngestionStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }

    #[test]
    fn test_tenant_requires_id() {
        assert!(Tenant::new("  ").is_err());
        let t = Tenant::new("acme").unwrap();
        assert_eq!(t.actor(), ANONYMOUS_USER);
        assert_eq!(t.with_user("alice").actor(), "alice");
    }

    #[test]
    fn test_page_bounds() {
        assert!(Page::new(0, 0).validate(100).is_err());
        assert!(Page::new(0, 101).validate(100).is_err());
        let p = Page::new(3, 20);
        assert!(p.validate(100).is_ok());
        assert_eq!(p.offset(), 60);
    }
}
