//! Memory layers and the static item-type classification table

use crate::item::MemoryItemType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cognitive/temporal role of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryLayer {
    /// Working context for the current session
    ShortTerm,
    /// Task history and error logs
    Episodic,
    /// Knowledge, code and requirements
    Semantic,
}

impl MemoryLayer {
    pub const ALL: [MemoryLayer; 3] = [Self::ShortTerm, Self::Episodic, Self::Semantic];

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "SHORT_TERM",
            Self::Episodic => "EPISODIC",
            Self::Semantic => "SEMANTIC",
        }
    }
}

impl fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an item type to its layer.
///
/// Types outside the table land in [`MemoryLayer::ShortTerm`] so a
/// classification gap never blocks a write.
pub fn classify(item_type: &MemoryItemType) -> MemoryLayer {
    match item_type.normalized() {
        MemoryItemType::Context => MemoryLayer::ShortTerm,
        MemoryItemType::TaskHistory | MemoryItemType::ErrorLog => MemoryLayer::Episodic,
        MemoryItemType::Knowledge | MemoryItemType::Code | MemoryItemType::Requirement => {
            MemoryLayer::Semantic
        }
        _ => MemoryLayer::ShortTerm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(&MemoryItemType::Context), MemoryLayer::ShortTerm);
        assert_eq!(classify(&MemoryItemType::TaskHistory), MemoryLayer::Episodic);
        assert_eq!(classify(&MemoryItemType::ErrorLog), MemoryLayer::Episodic);
        assert_eq!(classify(&MemoryItemType::Knowledge), MemoryLayer::Semantic);
        assert_eq!(classify(&MemoryItemType::Code), MemoryLayer::Semantic);
        assert_eq!(classify(&MemoryItemType::Requirement), MemoryLayer::Semantic);
    }

    #[test]
    fn test_unknown_types_fail_closed() {
        assert_eq!(classify(&MemoryItemType::Review), MemoryLayer::ShortTerm);
        assert_eq!(classify(&MemoryItemType::Idea), MemoryLayer::ShortTerm);
        assert_eq!(
            classify(&MemoryItemType::Other("DOCUMENTATION".into())),
            MemoryLayer::ShortTerm
        );
    }

    #[test]
    fn test_known_names_spelled_as_other_classify_normally() {
        assert_eq!(classify(&MemoryItemType::Other("code".into())), MemoryLayer::Semantic);
    }

    #[test]
    fn test_layer_serde_names() {
        let json = serde_json::to_string(&MemoryLayer::ShortTerm).unwrap();
        assert_eq!(json, "\"SHORT_TERM\"");
        let layer: MemoryLayer = serde_json::from_str("\"SEMANTIC\"").unwrap();
        assert_eq!(layer, MemoryLayer::Semantic);
    }
}
