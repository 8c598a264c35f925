// Batch writer: bulk-insert internal callables under their graph-scoped
// local ids, then rewrite every edge endpoint to a store id before the edges
// themselves are written.

use std::collections::HashMap;

use metadb_graph::LocalId;
use tracing::debug;

use crate::config::MAX_BATCH_SIZE;
use crate::error::IngestError;
use crate::store::MetadataStore;
use crate::types::{CallableId, Metadata, NewCallable, NewEdge};

/// An internal callable still addressed by its local id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCallable {
    pub local_id: LocalId,
    pub callable: NewCallable,
}

/// One end of an edge before remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeEndpoint {
    /// An internal callable written in this ingestion.
    Local(LocalId),
    /// A callable whose store id is already known (externals).
    Stored(CallableId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdge {
    pub source: EdgeEndpoint,
    pub target: EdgeEndpoint,
    pub metadata: Metadata,
}

/// Immutable local id → store id mapping for one ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ids: HashMap<LocalId, CallableId>,
}

impl IdMap {
    pub fn get(&self, local: LocalId) -> Option<CallableId> {
        self.ids.get(&local).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn resolve(&self, endpoint: EdgeEndpoint) -> Result<CallableId, IngestError> {
        match endpoint {
            EdgeEndpoint::Stored(id) => Ok(id),
            EdgeEndpoint::Local(local) => self
                .get(local)
                .ok_or(IngestError::UnmappedLocalId(local.0)),
        }
    }

    /// Rewrite every edge onto store ids. Fails on the first unmapped local id.
    pub fn remap(&self, edges: &[PendingEdge]) -> Result<Vec<NewEdge>, IngestError> {
        edges
            .iter()
            .map(|edge| {
                Ok(NewEdge {
                    source: self.resolve(edge.source)?,
                    target: self.resolve(edge.target)?,
                    metadata: edge.metadata.clone(),
                })
            })
            .collect()
    }
}

impl FromIterator<(LocalId, CallableId)> for IdMap {
    fn from_iter<I: IntoIterator<Item = (LocalId, CallableId)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Writes callables and edges in fixed-size chunks.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriter {
    batch_size: usize,
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self { batch_size: 4096 }
    }
}

impl BatchWriter {
    /// Chunk size is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upsert internal callables chunk by chunk and map each local id to the
    /// store id returned at the same position.
    pub async fn write_callables(
        &self,
        store: &dyn MetadataStore,
        pending: &[PendingCallable],
    ) -> crate::error::Result<IdMap> {
        let mut ids = HashMap::with_capacity(pending.len());
        for (index, chunk) in pending.chunks(self.batch_size).enumerate() {
            let rows: Vec<NewCallable> = chunk.iter().map(|p| p.callable.clone()).collect();
            let stored = store.upsert_callables_batch(&rows).await?;
            debug!(chunk = index, rows = stored.len(), "Wrote callable chunk");
            ids.extend(chunk.iter().map(|p| p.local_id).zip(stored));
        }
        Ok(IdMap { ids })
    }

    /// Remap edges through `id_map` and upsert them chunk by chunk.
    pub async fn write_edges(
        &self,
        store: &dyn MetadataStore,
        id_map: &IdMap,
        pending: &[PendingEdge],
    ) -> crate::error::Result<usize> {
        let edges = id_map.remap(pending)?;
        let mut written = 0;
        for (index, chunk) in edges.chunks(self.batch_size).enumerate() {
            written += store.upsert_edges_batch(chunk).await?;
            debug!(chunk = index, rows = chunk.len(), "Wrote edge chunk");
        }
        Ok(written)
    }
}
