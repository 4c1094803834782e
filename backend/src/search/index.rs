//! Tantivy-backed full-text index over resource documents.
//!
//! A [`SearchIndex`] is a union of named [`SubIndex`]es, one RAM index per
//! resource kind. It is built once and never written afterwards; [`SharedIndex`]
//! publishes a finished index by swapping a pointer, so readers always see a
//! complete build.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use serde::Serialize;
use tantivy::{
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError,
    collector::{Count, TopDocs},
    query::QueryParser,
    schema::{Field, STORED, STRING, Schema, TEXT, Value},
};

use super::document::{ResourceDocument, ResourceKind};
use crate::error::AppError;

/// Smallest arena tantivy accepts for one indexing thread.
const WRITER_MEMORY: usize = 15_000_000;

const DOC_ID: &str = "doc_id";
const LABELS: &str = "labels";
const TEXT_FIELDS: [&str; 9] = [
    "id", "name", "image", "state", "status", "command", "tags", "digests", LABELS,
];

/// Splits text into lowercase alphanumeric terms, the way the default tantivy
/// tokenizer does for indexed text.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn build_error(err: TantivyError) -> AppError {
    AppError::IndexBuild(err.to_string())
}

#[derive(Clone)]
struct ResourceSchema {
    schema: Schema,
    doc_id: Field,
    text: BTreeMap<&'static str, Field>,
}

impl ResourceSchema {
    fn new() -> Self {
        let mut builder = Schema::builder();
        let doc_id = builder.add_text_field(DOC_ID, STRING | STORED);
        let text = TEXT_FIELDS
            .iter()
            .map(|name| (*name, builder.add_text_field(name, TEXT)))
            .collect();
        Self {
            schema: builder.build(),
            doc_id,
            text,
        }
    }

    /// `label.<key>` document fields all land in the one `labels` field.
    fn field_for(&self, name: &str) -> Option<Field> {
        let name = if name.starts_with("label.") { LABELS } else { name };
        self.text.get(name).copied()
    }

    fn searchable(&self) -> Vec<Field> {
        self.text.values().copied().collect()
    }
}

/// Collects the documents of one sub-index until [`SubIndexWriter::finish`].
pub struct SubIndexWriter {
    name: String,
    fields: ResourceSchema,
    index: Index,
    writer: IndexWriter,
    known: HashSet<String>,
}

impl SubIndexWriter {
    pub fn for_kind(kind: ResourceKind) -> Result<Self, AppError> {
        let fields = ResourceSchema::new();
        let index = Index::create_in_ram(fields.schema.clone());
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_MEMORY)
            .map_err(build_error)?;
        Ok(Self {
            name: kind.index_name().to_string(),
            fields,
            index,
            writer,
            known: HashSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn add(&mut self, document: &ResourceDocument) -> Result<(), AppError> {
        if !self.known.insert(document.id.clone()) {
            return Err(AppError::IndexBuild(format!(
                "duplicate document {} in {}",
                document.id, self.name
            )));
        }

        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.doc_id, &document.id);
        for (name, value) in &document.fields {
            let field = self.fields.field_for(name).ok_or_else(|| {
                AppError::IndexBuild(format!("{} has no field {name}", self.name))
            })?;
            doc.add_text(field, value);
        }
        self.writer.add_document(doc).map_err(build_error)?;
        Ok(())
    }

    /// Commits the documents and opens the reader queries will use.
    pub fn finish(mut self) -> Result<SubIndex, AppError> {
        self.writer.commit().map_err(build_error)?;
        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(build_error)?;
        Ok(SubIndex {
            documents: self.known.len(),
            name: self.name,
            fields: self.fields,
            index: self.index,
            reader,
        })
    }
}

pub struct SubIndex {
    name: String,
    fields: ResourceSchema,
    index: Index,
    reader: IndexReader,
    documents: usize,
}

impl SubIndex {
    pub fn len(&self) -> usize {
        self.documents
    }

    /// OR query over every text field; returns the match count and the best
    /// `limit` hits.
    fn search(&self, query: &str, limit: usize) -> Result<(usize, Vec<SearchHit>), AppError> {
        let parser = QueryParser::for_index(&self.index, self.fields.searchable());
        let query = parser
            .parse_query(query)
            .map_err(|err| AppError::Query(err.to_string()))?;

        let searcher = self.reader.searcher();
        let (top, total) = searcher.search(&query, &(TopDocs::with_limit(limit.max(1)), Count))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top.into_iter().take(limit) {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(id) = doc.get_first(self.fields.doc_id).and_then(|value| value.as_str()) else {
                continue;
            };
            hits.push(SearchHit {
                id: id.to_string(),
                index: self.name.clone(),
                score,
            });
        }
        Ok((total, hits))
    }
}

impl std::fmt::Debug for SubIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubIndex")
            .field("name", &self.name)
            .field("documents", &self.documents)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Name of the sub-index the hit came from.
    pub index: String,
    pub score: f32,
}

impl SearchHit {
    pub fn kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_index_name(&self.index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    /// Every matching document, including those cut by the limit.
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub documents: usize,
    pub sub_indices: BTreeMap<String, usize>,
    pub built_at: u64,
}

#[derive(Debug)]
pub struct SearchIndex {
    generation: u64,
    built_at: SystemTime,
    sub_indices: Vec<SubIndex>,
}

impl SearchIndex {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: UNIX_EPOCH,
            sub_indices: Vec::new(),
        }
    }

    pub fn new(generation: u64, sub_indices: Vec<SubIndex>) -> Self {
        Self {
            generation,
            built_at: SystemTime::now(),
            sub_indices,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn document_count(&self) -> usize {
        self.sub_indices.iter().map(SubIndex::len).sum()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            generation: self.generation,
            documents: self.document_count(),
            sub_indices: self
                .sub_indices
                .iter()
                .map(|sub| (sub.name.clone(), sub.len()))
                .collect(),
            built_at: self
                .built_at
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Match query across every sub-index, best hits first.
    ///
    /// The raw query is reduced to its terms before parsing, so user input
    /// never reaches the query grammar.
    pub fn search(&self, query: &str, limit: usize) -> Result<SearchResults, AppError> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query).filter(|term| seen.insert(term.clone())).collect();
        if terms.is_empty() {
            return Ok(SearchResults::default());
        }
        let query = terms.join(" ");

        let mut total = 0;
        let mut hits = Vec::new();
        for sub in &self.sub_indices {
            let (matched, sub_hits) = sub.search(&query, limit)?;
            total += matched;
            hits.extend(sub_hits);
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.index.cmp(&b.index))
        });
        hits.truncate(limit);

        Ok(SearchResults { total, hits })
    }
}

/// The one published index. Writers replace it whole; readers never lock.
#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<ArcSwap<SearchIndex>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(SearchIndex::empty())),
        }
    }

    pub fn current(&self) -> Arc<SearchIndex> {
        self.inner.load_full()
    }

    pub fn publish(&self, index: SearchIndex) {
        self.inner.store(Arc::new(index));
    }
}

impl Default for SharedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIndex")
            .field("generation", &self.inner.load().generation)
            .finish()
    }
}
