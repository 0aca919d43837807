use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

/// Identifier of an ingested file, assigned by the status tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(NonZeroU32);

impl FileId {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of an indexed document: `{file_id}_{sheet}_{row_index}`.
///
/// The row index is always the last `_`-separated component and is numeric,
/// so two different rows can never produce the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn for_row(file_id: FileId, sheet: &str, row_index: u64) -> Self {
        Self(format!("{file_id}_{sheet}_{row_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover a document id from its stored string form.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_creation() {
        assert!(FileId::new(0).is_none());

        let id = FileId::new(42).unwrap();
        assert_eq!(id.value(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_document_id_is_deterministic() {
        let id = FileId::new(7).unwrap();
        let a = DocumentId::for_row(id, "Parts", 12);
        let b = DocumentId::for_row(id, "Parts", 12);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "7_Parts_12");
    }

    #[test]
    fn test_document_id_distinguishes_sheets_with_underscores() {
        let id = FileId::new(1).unwrap();
        let a = DocumentId::for_row(id, "stock_2", 3);
        let b = DocumentId::for_row(id, "stock", 23);
        assert_ne!(a, b);
    }
}
