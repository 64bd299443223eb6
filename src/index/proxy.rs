//! Reader side of the index.
//!
//! The proxy evaluates queries against the committed index and then patches the
//! result with the writer's pending cache, so a caller sees its own writes before
//! they are committed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::backend::IndexBackend;
use super::document::IndexedDoc;
use super::query::{resolve, FindRequest, Query};
use super::{IndexError, IndexResult};
use crate::metadata::Metadata;

/// Staged but uncommitted write of one document.
#[derive(Clone, Debug)]
pub struct PendingEntry {
    /// Queue seqno of the latest write to the document.
    pub seqno: u64,

    /// Committed image before the first pending write.
    pub pre: Option<IndexedDoc>,

    /// Image after the latest pending write; `None` for a removal.
    pub post: Option<IndexedDoc>,
}

/// How a pending write changes a query's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingEffect {
    /// Did not match before, matches now.
    Added,
    /// Matched before, no longer matches.
    Removed,
    /// Matches before and after; the projection changed.
    Updated,
    Unaffected,
}

impl PendingEntry {
    pub fn classify(&self, query: &Query, metadata: &Metadata) -> IndexResult<PendingEffect> {
        let before = match &self.pre {
            Some(doc) => query.matches(doc, metadata)?,
            None => false,
        };
        let after = match &self.post {
            Some(doc) => query.matches(doc, metadata)?,
            None => false,
        };
        Ok(match (before, after) {
            (false, true) => PendingEffect::Added,
            (true, false) => PendingEffect::Removed,
            (true, true) => PendingEffect::Updated,
            (false, false) => PendingEffect::Unaffected,
        })
    }
}

/// Pending writes shared between a writer and its readers.
pub type PendingCache = Arc<RwLock<HashMap<String, PendingEntry>>>;

pub fn new_pending_cache() -> PendingCache {
    Arc::new(RwLock::new(HashMap::new()))
}

/// One find result row.
#[derive(Clone, Debug)]
pub struct Hit {
    pub doc: IndexedDoc,

    /// Size of the group this row represents, when grouping.
    pub grouped: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct FindResult {
    pub hits: Vec<Hit>,

    /// Number of matching rows (groups, when grouping) before paging.
    pub total: usize,
}

/// Query front end of one resource.
pub struct IndexProxy {
    backend: Arc<IndexBackend>,
    metadata: Arc<Metadata>,
    pending: PendingCache,

    /// Used when a request names no languages.
    languages: Vec<String>,
}

impl IndexProxy {
    pub fn new(
        backend: Arc<IndexBackend>,
        metadata: Arc<Metadata>,
        pending: PendingCache,
        languages: Vec<String>,
    ) -> Self {
        Self {
            backend,
            metadata,
            pending,
            languages,
        }
    }

    pub fn backend(&self) -> &Arc<IndexBackend> {
        &self.backend
    }

    /// Latest indexed image of a document, pending writes included.
    pub fn get(&self, guid: &str) -> IndexResult<Option<IndexedDoc>> {
        if let Some(entry) = self.pending.read().get(guid) {
            return Ok(entry.post.clone());
        }
        self.backend.get(guid)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn find(&self, request: &FindRequest) -> IndexResult<FindResult> {
        let query = request.compile()?;

        // Snapshot the cache before reading committed state.
        let pending = self.pending.read().clone();
        let mut guids = self.backend.search(&query, &self.metadata)?;

        for (guid, entry) in &pending {
            let effect = entry.classify(&query, &self.metadata)?;
            match effect {
                PendingEffect::Added | PendingEffect::Updated => {
                    guids.insert(guid.clone());
                }
                PendingEffect::Removed | PendingEffect::Unaffected => {
                    guids.remove(guid);
                }
            }
        }

        let mut docs = Vec::with_capacity(guids.len());
        for guid in guids {
            let doc = match pending.get(&guid) {
                Some(entry) => entry.post.clone(),
                None => self.backend.get(&guid)?,
            };
            if let Some(doc) = doc {
                docs.push(doc);
            }
        }

        let languages = if request.languages.is_empty() {
            self.languages.clone()
        } else {
            request.languages.clone()
        };
        self.sort(&mut docs, request, &query, &languages)?;

        let hits = match &request.group_by {
            Some(name) => self.group(docs, name)?,
            None => docs
                .into_iter()
                .map(|doc| Hit { doc, grouped: None })
                .collect(),
        };

        let total = hits.len();
        let hits: Vec<Hit> = hits
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect();

        debug!(
            resource = %self.metadata.name(),
            total,
            returned = hits.len(),
            pending = pending.len(),
            "Find"
        );
        Ok(FindResult { hits, total })
    }

    fn sort(
        &self,
        docs: &mut [IndexedDoc],
        request: &FindRequest,
        query: &Query,
        languages: &[String],
    ) -> IndexResult<()> {
        let mut keys = Vec::new();
        for order in &request.order_by {
            let (descending, name) = match order.strip_prefix('-') {
                Some(name) => (true, name),
                None => (false, order.strip_prefix('+').unwrap_or(order)),
            };
            let prop = resolve(&self.metadata, name)?;
            let slot = prop
                .slot
                .ok_or_else(|| IndexError::Query(format!("{} is not sortable", name)))?;
            keys.push((slot, descending));
        }

        if keys.is_empty() && query.is_ranked() {
            let mut scored: Vec<(usize, IndexedDoc)> = docs
                .iter()
                .map(|doc| (query.score(doc, &self.metadata), doc.clone()))
                .collect();
            scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.guid.cmp(&b.guid)));
            for (target, (_, doc)) in docs.iter_mut().zip(scored) {
                *target = doc;
            }
            return Ok(());
        }

        docs.sort_by(|a, b| {
            for (slot, descending) in &keys {
                let ordering = match (a.slots.get(slot), b.slots.get(slot)) {
                    (Some(x), Some(y)) => x.compare(y, languages),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = if *descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.guid.cmp(&b.guid)
        });
        Ok(())
    }

    fn group(&self, docs: Vec<IndexedDoc>, name: &str) -> IndexResult<Vec<Hit>> {
        let prop = resolve(&self.metadata, name)?;
        if !prop.is_indexed() {
            return Err(IndexError::Query(format!("{} is not indexed", name)));
        }

        let mut hits: Vec<Hit> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let key = doc.props.get(&prop.name).cloned().unwrap_or_default();
            match positions.get(&key) {
                Some(&at) => {
                    if let Some(count) = hits[at].grouped.as_mut() {
                        *count += 1;
                    }
                }
                None => {
                    positions.insert(key, hits.len());
                    hits.push(Hit {
                        doc,
                        grouped: Some(1),
                    });
                }
            }
        }
        Ok(hits)
    }
}
