//! Memory items - the canonical unit stored by every adapter
//!
//! A [`MemoryItem`] is immutable once written: an update produces a new
//! version under the same id, never an in-place overwrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Ordered metadata attached to an item (`edrr_phase`, `language`, `tags`, ...)
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kind of information an item carries
///
/// The set is open: unknown kinds round-trip through [`MemoryItemType::Other`]
/// with their spelling intact. Equality, ordering and hashing ignore ASCII
/// case, so `Other("documentation")` and `Other("DOCUMENTATION")` are the
/// same type.
#[derive(Debug, Clone)]
pub enum MemoryItemType {
    Context,
    TaskHistory,
    ErrorLog,
    Knowledge,
    Code,
    Requirement,
    Review,
    Idea,
    Other(String),
}

impl MemoryItemType {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Context => "CONTEXT",
            Self::TaskHistory => "TASK_HISTORY",
            Self::ErrorLog => "ERROR_LOG",
            Self::Knowledge => "KNOWLEDGE",
            Self::Code => "CODE",
            Self::Requirement => "REQUIREMENT",
            Self::Review => "REVIEW",
            Self::Idea => "IDEA",
            Self::Other(name) => name,
        }
    }

    /// Parse a type name, case-insensitively; unknown names keep their spelling
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        match name.to_ascii_uppercase().as_str() {
            "CONTEXT" => Self::Context,
            "TASK_HISTORY" => Self::TaskHistory,
            "ERROR_LOG" => Self::ErrorLog,
            "KNOWLEDGE" => Self::Knowledge,
            "CODE" => Self::Code,
            "REQUIREMENT" => Self::Requirement,
            "REVIEW" => Self::Review,
            "IDEA" => Self::Idea,
            _ => Self::Other(name.to_string()),
        }
    }

    /// The known variant an `Other` spelling names, or `self`
    pub fn normalized(&self) -> Self {
        match self {
            Self::Other(name) => Self::parse(name),
            known => known.clone(),
        }
    }

    fn canonical_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.as_str().bytes().map(|b| b.to_ascii_uppercase())
    }
}

impl PartialEq for MemoryItemType {
    fn eq(&self, other: &Self) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

impl Eq for MemoryItemType {}

impl Hash for MemoryItemType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.canonical_bytes() {
            state.write_u8(byte);
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for MemoryItemType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryItemType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_bytes().cmp(other.canonical_bytes())
    }
}

impl fmt::Display for MemoryItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MemoryItemType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MemoryItemType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// A versioned unit of memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Stable identifier; empty until the manager assigns one
    pub id: String,

    /// Opaque payload (text, code, structured blob)
    pub content: serde_json::Value,

    /// Kind of item, drives layer classification
    pub item_type: MemoryItemType,

    /// Auxiliary attributes
    #[serde(default)]
    pub metadata: Metadata,

    /// Optional embedding for similarity queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Version number, starts at 1
    pub version: u64,

    /// When the id was first stored
    pub created_at: DateTime<Utc>,

    /// When this version was written
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    /// Create a new unsaved item
    pub fn new(item_type: MemoryItemType, content: impl Into<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            content: content.into(),
            item_type,
            metadata: Metadata::new(),
            embedding: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach a pre-computed embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Override the update timestamp
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Derive the next revision of this item with new content
    pub fn revise(&self, content: impl Into<serde_json::Value>) -> Self {
        let mut next = self.clone();
        next.content = content.into();
        next.updated_at = Utc::now();
        next
    }

    /// Content rendered as text for matching and scoring
    pub fn content_text(&self) -> String {
        value_text(&self.content)
    }

    /// Metadata value rendered as text
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(value_text)
    }

    /// EDRR phase tag if present
    pub fn edrr_phase(&self) -> Option<String> {
        self.metadata_text("edrr_phase")
    }

    /// Whether two items carry the same payload, ignoring version and timestamps
    pub fn same_payload(&self, other: &MemoryItem) -> bool {
        self.content == other.content
            && self.metadata == other.metadata
            && self.item_type == other.item_type
            && self.embedding == other.embedding
    }
}

/// Render a JSON value as plain text (strings without quotes)
pub(crate) fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reference to an item living in a specific adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    /// Item id
    pub id: String,
    /// Label of the adapter holding it
    pub adapter: String,
}

impl ItemRef {
    /// Reference `id` inside `adapter`
    pub fn new(id: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adapter: adapter.into(),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.adapter)
    }
}

/// Directed edge between two items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Tail of the edge
    pub source: ItemRef,
    /// Head of the edge
    pub target: ItemRef,
    /// Free-form label such as `depends_on` or `implements`
    pub relation_type: String,
    /// Strength in 0.0..=1.0
    pub strength: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Relationship {
    /// Edge of full strength with no metadata
    pub fn new(source: ItemRef, target: ItemRef, relation_type: impl Into<String>) -> Self {
        Self {
            source,
            target,
            relation_type: relation_type.into(),
            strength: 1.0,
            metadata: Metadata::new(),
        }
    }

    /// Set strength, clamped to 0.0..=1.0
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }

    /// Add a metadata entry to the edge
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
