use tantivy::schema::{FAST, Field, INDEXED, STORED, STRING, Schema, SchemaBuilder, TEXT};

/// Fields of the row index.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    /// `{file_id}_{sheet}_{row_index}`, the upsert key.
    pub doc_id: Field,
    pub file_id: Field,
    pub sheet: Field,
    pub row_index: Field,
    /// Part number as found in the sheet.
    pub part_number: Field,
    /// Part number reduced to its match key.
    pub part_key: Field,
    /// One `column=value` term per non-empty cell, lowercased.
    pub cell_terms: Field,
    /// Free text for keyword search.
    pub content: Field,
    /// Column map as JSON.
    pub fields: Field,
    /// Embedding as little-endian f32 bytes.
    pub embedding: Field,
}

impl IndexSchema {
    pub fn build() -> (Schema, IndexSchema) {
        let mut builder = SchemaBuilder::default();

        let doc_id = builder.add_text_field("doc_id", STRING | STORED);
        let file_id = builder.add_u64_field("file_id", INDEXED | STORED | FAST);
        let sheet = builder.add_text_field("sheet", STRING | STORED);
        let row_index = builder.add_u64_field("row_index", STORED | FAST);
        let part_number = builder.add_text_field("part_number", STORED);
        let part_key = builder.add_text_field("part_key", STRING);
        let cell_terms = builder.add_text_field("cell_terms", STRING);
        let content = builder.add_text_field("content", TEXT);
        let fields = builder.add_text_field("fields", STORED);
        let embedding = builder.add_bytes_field("embedding", STORED);

        let schema = builder.build();
        let index_schema = IndexSchema {
            doc_id,
            file_id,
            sheet,
            row_index,
            part_number,
            part_key,
            cell_terms,
            content,
            fields,
            embedding,
        };

        (schema, index_schema)
    }
}

/// Term stored for an exact `column = value` match.
pub fn cell_term(column: &str, value: &str) -> String {
    format!("{}={}", column.trim().to_lowercase(), value.trim().to_lowercase())
}

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_bytes_preserve_values() {
        let vector = vec![0.25f32, -1.5, 3.0e-7];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }

    #[test]
    fn test_cell_term_is_case_insensitive() {
        assert_eq!(cell_term(" Vendor ", "ACME Corp"), "vendor=acme corp");
    }
}
