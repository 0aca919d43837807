//! Tantivy-backed row index.
//!
//! Every upsert batch is one writer transaction: stale copies of the batch's
//! documents are deleted by id, the new versions added, then committed.
//! A failed commit is rolled back so a retry starts from the last good state.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tantivy::{
    DocAddress, Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, Searcher,
    TantivyDocument, Term,
    collector::{Count, DocSetCollector, TopDocs},
    directory::MmapDirectory,
    query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::{Field, IndexRecordOption, Value},
};

use super::schema::{IndexSchema, cell_term, decode_embedding, encode_embedding};
use super::{
    IndexError, IndexFilter, IndexQuery, IndexResult, IndexedDocument, SearchHit, SearchIndex,
    SearchPage,
};
use crate::embedding::cosine_similarity;
use crate::parsing::part_number;
use crate::types::FileId;
use crate::{debug_event, warn_event};

/// Smallest writer budget tantivy accepts for one indexing thread.
const MIN_WRITER_HEAP: usize = 15_000_000;

pub struct TantivyIndex {
    index: Index,
    reader: IndexReader,
    schema: IndexSchema,
    index_path: Option<PathBuf>,
    writer: Mutex<IndexWriter<TantivyDocument>>,
}

impl std::fmt::Debug for TantivyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyIndex")
            .field("index_path", &self.index_path)
            .field("schema", &self.schema)
            .finish()
    }
}

impl TantivyIndex {
    /// Open the index at `index_path`, creating it if needed.
    pub fn open(index_path: impl AsRef<Path>, writer_heap: usize) -> IndexResult<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&index_path)?;

        let (schema, index_schema) = IndexSchema::build();
        let index = if index_path.join("meta.json").exists() {
            Index::open_in_dir(&index_path)?
        } else {
            let dir = MmapDirectory::open(&index_path)?;
            Index::create(dir, schema, IndexSettings::default())?
        };

        Self::from_index(index, index_schema, Some(index_path), writer_heap)
    }

    /// A throwaway index held in RAM.
    pub fn in_memory(writer_heap: usize) -> IndexResult<Self> {
        let (schema, index_schema) = IndexSchema::build();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, index_schema, None, writer_heap)
    }

    fn from_index(
        index: Index,
        schema: IndexSchema,
        index_path: Option<PathBuf>,
        writer_heap: usize,
    ) -> IndexResult<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer_with_num_threads(1, writer_heap.max(MIN_WRITER_HEAP))?;

        Ok(Self {
            index,
            reader,
            schema,
            index_path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    /// Apply changes and commit them, or roll everything back.
    fn write<F>(&self, apply: F) -> IndexResult<()>
    where
        F: FnOnce(&mut IndexWriter<TantivyDocument>, &IndexSchema) -> IndexResult<()>,
    {
        let mut writer = self.writer.lock();
        let result = apply(&mut writer, &self.schema)
            .and_then(|()| writer.commit().map(|_| ()).map_err(IndexError::from));

        if let Err(e) = result {
            if let Err(rollback) = writer.rollback() {
                warn_event!("index", "rollback failed", "{rollback}");
            }
            return Err(e);
        }
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    fn to_document(&self, document: &IndexedDocument) -> IndexResult<TantivyDocument> {
        let s = &self.schema;
        let record = &document.record;
        let mut doc = TantivyDocument::default();

        doc.add_text(s.doc_id, document.id.as_str());
        doc.add_u64(s.file_id, u64::from(record.file_id.value()));
        doc.add_text(s.sheet, &record.sheet);
        doc.add_u64(s.row_index, record.row_index);

        if let Some(part) = &record.part_number {
            doc.add_text(s.part_number, part);
            let key = part_number::match_key(part);
            if !key.is_empty() {
                doc.add_text(s.part_key, &key);
            }
        }
        for (column, value) in &record.fields {
            doc.add_text(s.cell_terms, &cell_term(column, value));
        }
        doc.add_text(s.content, &record.embedding_text());

        let fields = serde_json::to_string(&record.fields).map_err(|e| {
            IndexError::Serialization(format!("{}: {e}", document.id))
        })?;
        doc.add_text(s.fields, &fields);
        doc.add_bytes(s.embedding, encode_embedding(&document.embedding).as_slice());

        Ok(doc)
    }

    fn hit_from_document(&self, doc: &TantivyDocument, score: f32) -> IndexResult<SearchHit> {
        let s = &self.schema;
        let text = |field: Field| doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string);

        let id = text(s.doc_id).ok_or_else(|| IndexError::InvalidDocument {
            doc_id: "?".to_string(),
            reason: "missing doc_id".to_string(),
        })?;
        let invalid = |reason: &str| IndexError::InvalidDocument {
            doc_id: id.clone(),
            reason: reason.to_string(),
        };

        let file_id = doc
            .get_first(s.file_id)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .and_then(FileId::new)
            .ok_or_else(|| invalid("bad file_id"))?;
        let fields: IndexMap<String, String> = match text(s.fields) {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| IndexError::Serialization(format!("{id}: {e}")))?,
            None => IndexMap::new(),
        };

        Ok(SearchHit {
            file_id,
            sheet: text(s.sheet).unwrap_or_default(),
            row_index: doc.get_first(s.row_index).and_then(|v| v.as_u64()).unwrap_or(0),
            part_number: text(s.part_number),
            fields,
            score,
            id,
        })
    }

    /// Scope clauses shared by every filter.
    fn scope_clauses(&self, query: &IndexQuery) -> Vec<(Occur, Box<dyn Query>)> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        if let Some(file_id) = query.file_id {
            let term = Term::from_field_u64(self.schema.file_id, u64::from(file_id.value()));
            clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
        }
        if let Some(sheet) = &query.sheet {
            let term = Term::from_field_text(self.schema.sheet, sheet);
            clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
        }
        clauses
    }

    fn combine(mut clauses: Vec<(Occur, Box<dyn Query>)>, main: Box<dyn Query>) -> Box<dyn Query> {
        if clauses.is_empty() {
            return main;
        }
        clauses.insert(0, (Occur::Must, main));
        Box::new(BooleanQuery::new(clauses))
    }

    fn keyword_query(&self, query: &IndexQuery) -> IndexResult<Option<Box<dyn Query>>> {
        let main: Box<dyn Query> = match &query.filter {
            IndexFilter::All => Box::new(AllQuery),
            IndexFilter::PartNumber(part) => {
                let key = part_number::match_key(part);
                if key.is_empty() {
                    return Ok(None);
                }
                let term = Term::from_field_text(self.schema.part_key, &key);
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            IndexFilter::Field { name, value } => {
                let term = Term::from_field_text(self.schema.cell_terms, &cell_term(name, value));
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            IndexFilter::Text(text) => {
                if text.trim().is_empty() {
                    return Err(IndexError::InvalidQuery("empty text query".to_string()));
                }
                let mut parser = QueryParser::for_index(&self.index, vec![self.schema.content]);
                parser.set_conjunction_by_default();
                let (parsed, errors) = parser.parse_query_lenient(text);
                if !errors.is_empty() {
                    debug_event!("index", "lenient parse", "{} issues in {text:?}", errors.len());
                }
                parsed
            }
            IndexFilter::Vector(_) => {
                return Err(IndexError::InvalidQuery(
                    "vector filters are not keyword queries".to_string(),
                ));
            }
        };
        Ok(Some(Self::combine(self.scope_clauses(query), main)))
    }

    fn keyword_search(
        &self,
        searcher: &Searcher,
        query: &IndexQuery,
        offset: usize,
        limit: usize,
    ) -> IndexResult<SearchPage> {
        let Some(tantivy_query) = self.keyword_query(query)? else {
            return Ok(SearchPage::empty(offset));
        };

        let total = searcher.search(&*tantivy_query, &Count)?;
        if limit == 0 || offset >= total {
            return Ok(SearchPage {
                total,
                offset,
                hits: Vec::new(),
            });
        }

        let top_docs = searcher.search(
            &*tantivy_query,
            &TopDocs::with_limit(limit.min(total - offset)).and_offset(offset),
        )?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(self.hit_from_document(&doc, score)?);
        }
        Ok(SearchPage {
            total,
            offset,
            hits,
        })
    }

    /// Exhaustive cosine scan over the documents in scope.
    fn vector_search(
        &self,
        searcher: &Searcher,
        query: &IndexQuery,
        vector: &[f32],
        offset: usize,
        limit: usize,
    ) -> IndexResult<SearchPage> {
        if vector.is_empty() {
            return Err(IndexError::InvalidQuery("empty query vector".to_string()));
        }
        let scope = Self::combine(self.scope_clauses(query), Box::new(AllQuery));
        let addresses = searcher.search(&*scope, &DocSetCollector)?;

        let mut scored: Vec<(f32, DocAddress)> = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(bytes) = doc.get_first(self.schema.embedding).and_then(|v| v.as_bytes())
            else {
                continue;
            };
            let embedding = decode_embedding(bytes);
            if embedding.len() != vector.len() {
                continue;
            }
            scored.push((cosine_similarity(vector, &embedding), address));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let total = scored.len();
        let mut hits = Vec::new();
        for (score, address) in scored.into_iter().skip(offset).take(limit) {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(self.hit_from_document(&doc, score)?);
        }
        Ok(SearchPage {
            total,
            offset,
            hits,
        })
    }
}

impl SearchIndex for TantivyIndex {
    fn upsert(&self, documents: &[IndexedDocument]) -> IndexResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let prepared = documents
            .iter()
            .map(|d| self.to_document(d))
            .collect::<IndexResult<Vec<_>>>()?;

        self.write(|writer, schema| {
            for (document, doc) in documents.iter().zip(prepared) {
                writer.delete_term(Term::from_field_text(schema.doc_id, document.id.as_str()));
                writer.add_document(doc)?;
            }
            Ok(())
        })?;

        debug_event!("index", "upserted", "{} documents", documents.len());
        Ok(())
    }

    fn count_for_file(&self, file_id: FileId) -> IndexResult<u64> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_u64(self.schema.file_id, u64::from(file_id.value()));
        let count = searcher.search(&TermQuery::new(term, IndexRecordOption::Basic), &Count)?;
        Ok(count as u64)
    }

    fn delete_file(&self, file_id: FileId) -> IndexResult<u64> {
        let existing = self.count_for_file(file_id)?;
        self.write(|writer, schema| {
            writer.delete_term(Term::from_field_u64(schema.file_id, u64::from(file_id.value())));
            Ok(())
        })?;
        debug_event!("index", "deleted", "file {file_id}: {existing} documents");
        Ok(existing)
    }

    fn search(&self, query: &IndexQuery, offset: usize, limit: usize) -> IndexResult<SearchPage> {
        let searcher = self.reader.searcher();
        match &query.filter {
            IndexFilter::Vector(vector) => {
                self.vector_search(&searcher, query, vector, offset, limit)
            }
            _ => self.keyword_search(&searcher, query, offset, limit),
        }
    }

    fn document_count(&self) -> IndexResult<u64> {
        Ok(self.reader.searcher().num_docs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::ParsedRecord;
    use tempfile::TempDir;

    const HEAP: usize = 20_000_000;

    fn record(file: u32, sheet: &str, row: u64, part: &str, vendor: &str) -> ParsedRecord {
        let mut fields = IndexMap::new();
        fields.insert("Part Number".to_string(), part.to_string());
        fields.insert("Vendor".to_string(), vendor.to_string());
        ParsedRecord {
            file_id: FileId::new(file).unwrap(),
            sheet: sheet.to_string(),
            row_index: row,
            fields,
            part_number: Some(part.to_string()),
        }
    }

    fn doc(file: u32, sheet: &str, row: u64, part: &str, vendor: &str) -> IndexedDocument {
        let embedding = vec![row as f32, 1.0];
        IndexedDocument::new(record(file, sheet, row, part, vendor), embedding)
    }

    fn seeded() -> TantivyIndex {
        let index = TantivyIndex::in_memory(HEAP).unwrap();
        index
            .upsert(&[
                doc(1, "Bolts", 2, "AB-100", "Acme"),
                doc(1, "Bolts", 3, "AB-200", "Globex"),
                doc(1, "Nuts", 2, "CD-300", "Acme"),
                doc(2, "Bolts", 2, "AB-100", "Initech"),
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let index = seeded();
        assert_eq!(index.count_for_file(FileId::new(1).unwrap()).unwrap(), 3);

        index.upsert(&[doc(1, "Bolts", 2, "AB-100", "Umbrella")]).unwrap();
        assert_eq!(index.count_for_file(FileId::new(1).unwrap()).unwrap(), 3);
        assert_eq!(index.document_count().unwrap(), 4);

        let page = index
            .search(
                &IndexQuery::new(IndexFilter::Field {
                    name: "vendor".to_string(),
                    value: "umbrella".to_string(),
                }),
                0,
                10,
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].id, "1_Bolts_2");
    }

    #[test]
    fn test_offset_past_total_returns_empty_page() {
        let index = seeded();
        let query = IndexQuery::new(IndexFilter::Text("acme".to_string()));
        for offset in [2, 3, usize::MAX - 5] {
            let page = index.search(&query, offset, 20).unwrap();
            assert_eq!(page.total, 2);
            assert_eq!(page.offset, offset);
            assert!(page.hits.is_empty());
        }

        let tail = index.search(&query, 1, usize::MAX).unwrap();
        assert_eq!(tail.hits.len(), 1);
    }

    #[test]
    fn test_part_number_match_ignores_formatting() {
        let index = seeded();
        let page = index
            .search(&IndexQuery::new(IndexFilter::PartNumber("ab 100".to_string())), 0, 10)
            .unwrap();
        assert_eq!(page.total, 2);

        let scoped = index
            .search(
                &IndexQuery::new(IndexFilter::PartNumber("AB100".to_string()))
                    .in_file(FileId::new(2).unwrap()),
                0,
                10,
            )
            .unwrap();
        assert_eq!(scoped.total, 1);
        assert_eq!(scoped.hits[0].fields["Vendor"], "Initech");
        assert_eq!(scoped.hits[0].part_number.as_deref(), Some("AB-100"));
    }

    #[test]
    fn test_text_search_with_sheet_scope() {
        let index = seeded();
        let page = index
            .search(
                &IndexQuery::new(IndexFilter::Text("acme".to_string())).in_sheet("Nuts"),
                0,
                10,
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].sheet, "Nuts");
    }

    #[test]
    fn test_pagination_reports_total() {
        let index = seeded();
        let query = IndexQuery::new(IndexFilter::All);
        let first = index.search(&query, 0, 3).unwrap();
        let second = index.search(&query, 3, 3).unwrap();
        assert_eq!(first.total, 4);
        assert_eq!(first.hits.len(), 3);
        assert_eq!(second.hits.len(), 1);
        assert_eq!(second.offset, 3);
    }

    #[test]
    fn test_vector_search_orders_by_similarity() {
        let index = TantivyIndex::in_memory(HEAP).unwrap();
        let mut near = doc(1, "S", 2, "AA-1", "x");
        near.embedding = vec![1.0, 0.0];
        let mut far = doc(1, "S", 3, "BB-2", "y");
        far.embedding = vec![0.0, 1.0];
        index.upsert(&[far, near]).unwrap();

        let page = index
            .search(&IndexQuery::new(IndexFilter::Vector(vec![0.9, 0.1])), 0, 10)
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.hits[0].id, "1_S_2");
        assert!(page.hits[0].score > page.hits[1].score);
    }

    #[test]
    fn test_delete_file() {
        let index = seeded();
        assert_eq!(index.delete_file(FileId::new(1).unwrap()).unwrap(), 3);
        assert_eq!(index.count_for_file(FileId::new(1).unwrap()).unwrap(), 0);
        assert_eq!(index.count_for_file(FileId::new(2).unwrap()).unwrap(), 1);
    }

    #[test]
    fn test_empty_text_query_rejected() {
        let index = seeded();
        assert!(matches!(
            index.search(&IndexQuery::new(IndexFilter::Text("  ".to_string())), 0, 10),
            Err(IndexError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_reopen_on_disk_index() {
        let dir = TempDir::new().unwrap();
        {
            let index = TantivyIndex::open(dir.path(), HEAP).unwrap();
            index.upsert(&[doc(5, "S", 2, "ZZ-9", "Acme")]).unwrap();
        }
        let index = TantivyIndex::open(dir.path(), HEAP).unwrap();
        assert_eq!(index.count_for_file(FileId::new(5).unwrap()).unwrap(), 1);
    }
}
