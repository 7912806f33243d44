use crate::backend::SearchHit;
use crate::error::{StoreError, StoreResult};
use crate::path::Prefix;
use parking_lot::Mutex;
use std::path::Path;
use tantivy::{
    collector::TopDocs,
    directory::MmapDirectory,
    query::{BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::{Field, IndexRecordOption, Schema, STORED, STRING, TEXT},
    Document as IndexDocument, Index, IndexReader, IndexWriter, ReloadPolicy, Term,
};

const WRITER_HEAP_BYTES: usize = 20_000_000;
const EXCERPT_RADIUS: usize = 60;

/// Most hits any single backend query returns. Collectors size their heaps
/// from the limit, so larger requests are clamped to this.
pub const MAX_HITS: usize = 4096;

/// Pluggable full-text search backend keyed by logical path.
pub trait SearchProvider: Send + Sync {
    fn index(&self, path: &str, content: &str) -> StoreResult<()>;
    fn remove(&self, path: &str) -> StoreResult<()>;
    fn search(&self, query: &str, prefix: Option<&Prefix>, limit: usize)
        -> StoreResult<Vec<SearchHit>>;
    fn clear(&self) -> StoreResult<()>;
    fn count(&self) -> StoreResult<u64>;
}

pub struct TantivySearch {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    path: Field,
    content: Field,
    dirs: Field,
}

impl TantivySearch {
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mmap = MmapDirectory::open(dir)
            .map_err(|e| StoreError::Internal(format!("search index directory: {e}")))?;
        Self::with_index(|schema| Index::open_or_create(mmap, schema))
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_index(|schema| Ok(Index::create_in_ram(schema)))
    }

    fn with_index(
        build: impl FnOnce(Schema) -> tantivy::Result<Index>,
    ) -> StoreResult<Self> {
        let mut schema_builder = Schema::builder();
        let path = schema_builder.add_text_field("path", STRING | STORED);
        let content = schema_builder.add_text_field("content", TEXT | STORED);
        let dirs = schema_builder.add_text_field("dirs", STRING);
        let index = build(schema_builder.build())?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            path,
            content,
            dirs,
        })
    }

    fn commit(&self, writer: &mut IndexWriter) -> StoreResult<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }
}

impl SearchProvider for TantivySearch {
    fn index(&self, path: &str, content: &str) -> StoreResult<()> {
        let mut doc = IndexDocument::default();
        doc.add_text(self.path, path);
        doc.add_text(self.content, content);
        for dir in ancestor_prefixes(path) {
            doc.add_text(self.dirs, dir);
        }
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.path, path));
        writer.add_document(doc)?;
        self.commit(&mut writer)
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.path, path));
        self.commit(&mut writer)
    }

    fn search(
        &self,
        query: &str,
        prefix: Option<&Prefix>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_HITS);
        let parser = QueryParser::for_index(&self.index, vec![self.content]);
        let text_query = parser
            .parse_query(&terms.join(" "))
            .map_err(|e| StoreError::Internal(format!("search query: {e}")))?;
        let query: Box<dyn Query> = match prefix.filter(|p| !p.is_root()) {
            Some(prefix) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, text_query),
                (
                    Occur::Must,
                    Box::new(TermQuery::new(
                        Term::from_field_text(self.dirs, prefix.as_str()),
                        IndexRecordOption::Basic,
                    )),
                ),
            ])),
            None => text_query,
        };

        let searcher = self.reader.searcher();
        let docs = searcher.search(query.as_ref(), &TopDocs::with_limit(limit))?;
        let mut hits = Vec::with_capacity(docs.len());
        for (score, addr) in docs {
            let retrieved = searcher.doc(addr)?;
            let Some(path) = retrieved.get_first(self.path).and_then(|v| v.as_text()) else {
                continue;
            };
            let content = retrieved
                .get_first(self.content)
                .and_then(|v| v.as_text())
                .unwrap_or_default();
            hits.push(SearchHit {
                path: path.to_string(),
                excerpt: excerpt(content, terms.first().map(String::as_str)),
                score,
            });
        }
        Ok(hits)
    }

    fn clear(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        self.commit(&mut writer)
    }

    fn count(&self) -> StoreResult<u64> {
        Ok(self.reader.searcher().num_docs())
    }
}

/// Every directory prefix enclosing `path`, excluding the root.
fn ancestor_prefixes(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        out.push(path[..=end].to_string());
    }
    out
}

/// Split a free-text query into plain terms, dropping query-language syntax.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Short snippet of `content` around the first occurrence of `term`.
pub fn excerpt(content: &str, term: Option<&str>) -> String {
    let lower = content.to_lowercase();
    let at = term
        .and_then(|t| lower.find(&t.to_lowercase()))
        .filter(|&i| content.is_char_boundary(i))
        .unwrap_or(0);
    let mut start = at.saturating_sub(EXCERPT_RADIUS);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + EXCERPT_RADIUS).min(content.len());
    while !content.is_char_boundary(end) {
        end += 1;
    }
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(content[start..end].trim());
    if end < content.len() {
        out.push_str("...");
    }
    out
}
