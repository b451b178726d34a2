//! Data types for the ingestion pipeline.
//!
//! [`SourceItem`] is what a connector produces. The normalized types shared
//! with the store and search layers live in `knowbase-core` and are
//! re-exported here.

use chrono::{DateTime, Utc};

pub use knowbase_core::models::{Chunk, ContextPassage, Document};

/// Raw item produced by a connector before normalization.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Connector instance, e.g. `filesystem:vault`.
    pub source: String,
    /// Path relative to the connector root.
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub body: String,
    pub metadata_json: String,
}
