//! Per-user index state and the manager that owns it.
//!
//! Each user has exactly one [`UserState`]: a vector index plus a metadata
//! entry list kept strictly parallel to it (entry `i` describes the `i`-th
//! stored vector). [`StoreManager`] maps user IDs to their states, loads
//! them from durable storage on first access, and serializes mutations per
//! user so the parallel-array invariant can never be observed broken.

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    index::VectorIndex,
    store_db::StoreDb,
};

/// Metadata for one indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub document_id: u64,
    pub title: String,
    pub content: String,
}

/// One user's index state: a vector index and its parallel metadata list.
///
/// Invariant: `entries.len() == index.len()` after every operation, and
/// entry `i` describes the vector at offset `i`.
#[derive(Debug)]
pub struct UserState {
    index: VectorIndex,
    entries: Vec<IndexedEntry>,
}

impl UserState {
    /// Create an empty state fixed to the given vector dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            index: VectorIndex::new(dimension),
            entries: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of vectors in the underlying index. Always equals [`len`]
    /// unless the state is corrupt.
    ///
    /// [`len`]: UserState::len
    pub fn vector_count(&self) -> usize {
        self.index.len()
    }

    /// Append a vector and its metadata entry as one logical unit.
    ///
    /// A dimension mismatch fails before either side is touched.
    pub fn add(&mut self, entry: IndexedEntry, vector: &[f32]) -> Result<()> {
        self.index.insert(vector)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Remove every entry for `document_id`, rebuilding the index from the
    /// retained vectors of the surviving entries.
    ///
    /// The rebuild reuses the vectors already stored in the index arena, so
    /// no re-embedding happens and survivors keep their original relative
    /// order. Returns `false` if the document was not indexed.
    pub fn remove(&mut self, document_id: u64) -> Result<bool> {
        if !self.entries.iter().any(|e| e.document_id == document_id) {
            return Ok(false);
        }

        let mut rebuilt = VectorIndex::new(self.index.dimension());
        let mut kept = Vec::with_capacity(self.entries.len());
        for (offset, entry) in self.entries.iter().enumerate() {
            if entry.document_id == document_id {
                continue;
            }
            if let Some(vector) = self.index.vector(offset) {
                rebuilt.insert(vector)?;
                kept.push(entry.clone());
            } else {
                warn!(
                    document_id = entry.document_id,
                    offset, "entry without a stored vector, dropping on rebuild"
                );
            }
        }

        self.index = rebuilt;
        self.entries = kept;
        Ok(true)
    }

    /// Return up to `top_k` `(entry, distance)` pairs, closest first.
    ///
    /// Offsets without a matching metadata entry are dropped with a warning
    /// rather than surfaced; they indicate state corruption.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(IndexedEntry, f32)>> {
        let hits = self.index.query(query, top_k)?;

        let mut results = Vec::with_capacity(hits.len());
        for (offset, distance) in hits {
            match self.entries.get(offset) {
                Some(entry) => results.push((entry.clone(), distance)),
                None => warn!(
                    offset,
                    "search hit without a metadata entry, dropping"
                ),
            }
        }
        Ok(results)
    }

    fn to_artifacts(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let index_bytes = self.index.to_bytes();
        let entry_bytes = serde_json::to_vec(&self.entries)?;
        Ok((index_bytes, entry_bytes))
    }

    fn from_artifacts(
        user_id: u64,
        index_bytes: &[u8],
        entry_bytes: &[u8],
    ) -> Result<Self> {
        let index =
            VectorIndex::from_bytes(index_bytes).ok_or_else(|| {
                Error::IndexCorruption {
                    user_id,
                    detail: "malformed vector blob".into(),
                }
            })?;

        let entries: Vec<IndexedEntry> = serde_json::from_slice(entry_bytes)
            .map_err(|e| Error::IndexCorruption {
                user_id,
                detail: format!("malformed metadata: {e}"),
            })?;

        if entries.len() != index.len() {
            return Err(Error::IndexCorruption {
                user_id,
                detail: format!(
                    "metadata length {} disagrees with vector count {}",
                    entries.len(),
                    index.len()
                ),
            });
        }

        Ok(Self { index, entries })
    }
}

/// Owns the mapping from user identity to index state.
///
/// States are loaded lazily from durable storage on first access and cached
/// behind per-user read-write locks; different users never contend on a
/// shared lock. `StoreManager` is `Send + Sync` and meant to be shared.
pub struct StoreManager {
    db: StoreDb,
    states: DashMap<u64, Arc<RwLock<UserState>>>,
}

impl StoreManager {
    /// Open the store database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: StoreDb::open(path)?,
            states: DashMap::new(),
        })
    }

    /// Open the store database under the resolved data directory.
    pub fn open_default() -> Result<Self> {
        let data_dir = DataDir::resolve(None)?;
        Self::open(&data_dir.store_db())
    }

    /// Return the state for `user_id`, loading it from disk if present and
    /// structurally valid, or creating an empty state fixed to `dimension`.
    ///
    /// A state whose dimension disagrees with `dimension` is recreated
    /// empty, whether it came from disk or was already cached; the model
    /// changed and the old vectors are unusable either way.
    ///
    /// Concurrent first accesses for the same user are serialized; exactly
    /// one load or creation happens.
    pub fn get_or_create(
        &self,
        user_id: u64,
        dimension: usize,
    ) -> Result<Arc<RwLock<UserState>>> {
        match self.states.entry(user_id) {
            Entry::Occupied(occupied) => {
                let shared = occupied.get().clone();
                drop(occupied);
                if read_lock(&shared)?.dimension() != dimension {
                    let mut guard = write_lock(&shared)?;
                    // Re-check under the write lock; another caller may
                    // have recreated the state already.
                    if guard.dimension() != dimension {
                        warn!(
                            user_id,
                            stored = guard.dimension(),
                            requested = dimension,
                            "cached index dimension disagrees with embedding \
                             model, recreating empty state"
                        );
                        *guard = UserState::new(dimension);
                    }
                }
                Ok(shared)
            }
            Entry::Vacant(vacant) => {
                let state = self.load_or_create(user_id, dimension)?;
                let shared = Arc::new(RwLock::new(state));
                vacant.insert(shared.clone());
                Ok(shared)
            }
        }
    }

    /// Append a document's vector and metadata, then persist both artifacts.
    ///
    /// The state dimension is fixed by the first embedding a user ever
    /// stores. The mutation and the durable write happen under the user's
    /// write lock, so the persisted pair is never torn.
    pub fn add_document(
        &self,
        user_id: u64,
        document_id: u64,
        title: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let state = self.get_or_create(user_id, embedding.len())?;
        let mut guard = write_lock(&state)?;

        guard.add(
            IndexedEntry {
                document_id,
                title: title.to_string(),
                content: content.to_string(),
            },
            embedding,
        )?;

        self.persist(user_id, &guard)?;
        debug!(user_id, document_id, "indexed document");
        Ok(())
    }

    /// Search a user's index, mapping hits back to their metadata entries.
    ///
    /// A user with no stored state gets an empty result.
    pub fn search(
        &self,
        user_id: u64,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(IndexedEntry, f32)>> {
        let Some(state) = self.get_loaded(user_id)? else {
            return Ok(Vec::new());
        };
        let guard = read_lock(&state)?;
        guard.search(query, top_k)
    }

    /// Remove a document from a user's index, rebuilding and persisting the
    /// surviving state. Returns `false` if the document was not indexed.
    pub fn remove_document(
        &self,
        user_id: u64,
        document_id: u64,
    ) -> Result<bool> {
        let Some(state) = self.get_loaded(user_id)? else {
            return Ok(false);
        };
        let mut guard = write_lock(&state)?;

        if !guard.remove(document_id)? {
            return Ok(false);
        }

        self.persist(user_id, &guard)?;
        debug!(user_id, document_id, "removed document from index");
        Ok(true)
    }

    /// Number of documents indexed for a user.
    pub fn document_count(&self, user_id: u64) -> Result<usize> {
        match self.get_loaded(user_id)? {
            Some(state) => Ok(read_lock(&state)?.len()),
            None => Ok(0),
        }
    }

    /// Evict a user's state from the cache and delete its durable artifacts.
    ///
    /// Used by the reindex recovery procedure. Returns `true` if anything
    /// existed.
    pub fn drop_user(&self, user_id: u64) -> Result<bool> {
        self.states.remove(&user_id);
        self.db.delete_state(user_id)
    }

    /// List all user IDs with durable state.
    pub fn user_ids(&self) -> Result<Vec<u64>> {
        self.db.list_user_ids()
    }

    fn load_or_create(
        &self,
        user_id: u64,
        dimension: usize,
    ) -> Result<UserState> {
        let Some((index_bytes, entry_bytes)) = self.db.load_state(user_id)?
        else {
            info!(user_id, "created new index");
            return Ok(UserState::new(dimension));
        };

        match UserState::from_artifacts(user_id, &index_bytes, &entry_bytes) {
            Ok(state) if state.dimension() == dimension => {
                info!(user_id, documents = state.len(), "loaded existing index");
                Ok(state)
            }
            Ok(state) => {
                warn!(
                    user_id,
                    stored = state.dimension(),
                    requested = dimension,
                    "stored index dimension disagrees with embedding model, \
                     recreating empty state"
                );
                Ok(UserState::new(dimension))
            }
            Err(err) => {
                warn!(user_id, %err, "corrupt index state, recreating empty");
                Ok(UserState::new(dimension))
            }
        }
    }

    /// Load a user's state without creating one if nothing is stored.
    fn get_loaded(
        &self,
        user_id: u64,
    ) -> Result<Option<Arc<RwLock<UserState>>>> {
        match self.states.entry(user_id) {
            Entry::Occupied(occupied) => Ok(Some(occupied.get().clone())),
            Entry::Vacant(vacant) => {
                let Some((index_bytes, entry_bytes)) =
                    self.db.load_state(user_id)?
                else {
                    return Ok(None);
                };

                match UserState::from_artifacts(
                    user_id,
                    &index_bytes,
                    &entry_bytes,
                ) {
                    Ok(state) => {
                        let shared = Arc::new(RwLock::new(state));
                        vacant.insert(shared.clone());
                        Ok(Some(shared))
                    }
                    Err(err) => {
                        warn!(
                            user_id,
                            %err,
                            "corrupt index state, treating as missing"
                        );
                        Ok(None)
                    }
                }
            }
        }
    }

    fn persist(&self, user_id: u64, state: &UserState) -> Result<()> {
        let (index_bytes, entry_bytes) = state.to_artifacts()?;
        self.db.save_state(user_id, &index_bytes, &entry_bytes)
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("cached_users", &self.states.len())
            .finish_non_exhaustive()
    }
}

fn read_lock(
    state: &Arc<RwLock<UserState>>,
) -> Result<RwLockReadGuard<'_, UserState>> {
    state
        .read()
        .map_err(|_| Error::Config("user state lock poisoned".into()))
}

fn write_lock(
    state: &Arc<RwLock<UserState>>,
) -> Result<RwLockWriteGuard<'_, UserState>> {
    state
        .write()
        .map_err(|_| Error::Config("user state lock poisoned".into()))
}
