use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, FileId};

/// One extracted spreadsheet row.
///
/// `fields` keeps column order as found in the header row. Empty cells are
/// omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub file_id: FileId,
    pub sheet: String,
    /// Row number within the sheet as shown by a spreadsheet application (1-based).
    pub row_index: u64,
    pub fields: IndexMap<String, String>,
    pub part_number: Option<String>,
}

impl ParsedRecord {
    pub fn document_id(&self) -> DocumentId {
        DocumentId::for_row(self.file_id, &self.sheet, self.row_index)
    }

    /// Text fed to the embedding model: part number first, then `column: value` pairs.
    pub fn embedding_text(&self) -> String {
        let mut text = String::new();
        if let Some(part) = &self.part_number {
            text.push_str(part);
        }
        for (column, value) in &self.fields {
            if !text.is_empty() {
                text.push_str("; ");
            }
            text.push_str(column);
            text.push_str(": ");
            text.push_str(value);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ParsedRecord {
        let mut fields = IndexMap::new();
        fields.insert("Part Number".to_string(), "AB-123".to_string());
        fields.insert("Qty".to_string(), "4".to_string());
        ParsedRecord {
            file_id: FileId::new(3).unwrap(),
            sheet: "Stock".to_string(),
            row_index: 9,
            fields,
            part_number: Some("AB-123".to_string()),
        }
    }

    #[test]
    fn test_embedding_text_keeps_column_order() {
        assert_eq!(
            record().embedding_text(),
            "AB-123; Part Number: AB-123; Qty: 4"
        );
    }

    #[test]
    fn test_document_id() {
        assert_eq!(record().document_id().as_str(), "3_Stock_9");
    }
}
