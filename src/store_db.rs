use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::warn;

use crate::error::Result;

const USER_VECTORS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("user_vectors");
const USER_ENTRIES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("user_entries");

/// Durable storage for per-user index state.
///
/// Each user's state is a pair of artifacts keyed by `user_id`: the vector
/// index blob and the serialized metadata entry list. The pair is always
/// written and deleted in a single transaction; a state with only one
/// artifact present is never served.
pub struct StoreDb {
    db: Database,
}

impl StoreDb {
    /// Open or create a store database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(redb::Error::from)?;

        // Ensure both tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(USER_VECTORS)?;
        txn.open_table(USER_ENTRIES)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Persist both state artifacts for a user in one transaction.
    pub fn save_state(
        &self,
        user_id: u64,
        index_bytes: &[u8],
        entry_bytes: &[u8],
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut vectors = txn.open_table(USER_VECTORS)?;
            vectors.insert(user_id, index_bytes)?;
            let mut entries = txn.open_table(USER_ENTRIES)?;
            entries.insert(user_id, entry_bytes)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Load both state artifacts for a user.
    ///
    /// Returns `None` when the user has no stored state. A half-present
    /// pair (one artifact without the other) is treated the same way, with
    /// a warning, so a torn state is recreated rather than served.
    pub fn load_state(
        &self,
        user_id: u64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let vectors = txn.open_table(USER_VECTORS)?;
        let entries = txn.open_table(USER_ENTRIES)?;

        let index_bytes = vectors.get(user_id)?.map(|v| v.value().to_vec());
        let entry_bytes = entries.get(user_id)?.map(|v| v.value().to_vec());

        match (index_bytes, entry_bytes) {
            (Some(i), Some(e)) => Ok(Some((i, e))),
            (None, None) => Ok(None),
            _ => {
                warn!(
                    user_id,
                    "half-present index state on disk, treating as missing"
                );
                Ok(None)
            }
        }
    }

    /// Remove both state artifacts for a user in one transaction.
    ///
    /// Returns `true` if any artifact existed.
    pub fn delete_state(&self, user_id: u64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut vectors = txn.open_table(USER_VECTORS)?;
            let had_vectors = vectors.remove(user_id)?.is_some();
            let mut entries = txn.open_table(USER_ENTRIES)?;
            let had_entries = entries.remove(user_id)?.is_some();
            had_vectors || had_entries
        };
        txn.commit()?;
        Ok(removed)
    }

    /// List all user IDs with a vector artifact on disk.
    pub fn list_user_ids(&self) -> Result<Vec<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USER_VECTORS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            result.push(k.value());
        }
        Ok(result)
    }
}

impl std::fmt::Debug for StoreDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, StoreDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = StoreDb::open(&tmp.path().join("stores.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn save_and_load() {
        let (_tmp, db) = test_db();

        db.save_state(7, b"index-bytes", b"entry-bytes").unwrap();

        let (index, entries) = db.load_state(7).unwrap().unwrap();
        assert_eq!(index, b"index-bytes");
        assert_eq!(entries, b"entry-bytes");
    }

    #[test]
    fn load_missing_returns_none() {
        let (_tmp, db) = test_db();
        assert!(db.load_state(42).unwrap().is_none());
    }

    #[test]
    fn states_are_isolated_per_user() {
        let (_tmp, db) = test_db();

        db.save_state(1, b"one", b"uno").unwrap();
        db.save_state(2, b"two", b"dos").unwrap();

        let (index, _) = db.load_state(1).unwrap().unwrap();
        assert_eq!(index, b"one");
        let (index, _) = db.load_state(2).unwrap().unwrap();
        assert_eq!(index, b"two");
    }

    #[test]
    fn overwrite_replaces_both_artifacts() {
        let (_tmp, db) = test_db();

        db.save_state(7, b"a", b"b").unwrap();
        db.save_state(7, b"c", b"d").unwrap();

        let (index, entries) = db.load_state(7).unwrap().unwrap();
        assert_eq!(index, b"c");
        assert_eq!(entries, b"d");
    }

    #[test]
    fn delete_removes_state() {
        let (_tmp, db) = test_db();

        db.save_state(7, b"a", b"b").unwrap();
        assert!(db.delete_state(7).unwrap());
        assert!(db.load_state(7).unwrap().is_none());
        assert!(!db.delete_state(7).unwrap());
    }

    #[test]
    fn list_user_ids_lists_saved_users() {
        let (_tmp, db) = test_db();

        db.save_state(3, b"a", b"b").unwrap();
        db.save_state(1, b"c", b"d").unwrap();

        let mut ids = db.list_user_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn half_present_pair_is_treated_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stores.redb");

        // Write a vector artifact without its metadata counterpart, the
        // way a torn state from an older database would look.
        {
            let db = Database::create(&path).unwrap();
            let txn = db.begin_write().unwrap();
            {
                let mut vectors = txn.open_table(USER_VECTORS).unwrap();
                vectors.insert(7u64, b"orphan vector blob".as_slice()).unwrap();
                txn.open_table(USER_ENTRIES).unwrap();
            }
            txn.commit().unwrap();
        }

        let db = StoreDb::open(&path).unwrap();
        assert!(db.load_state(7).unwrap().is_none());

        // Same for the opposite orphan.
        let txn = db.db.begin_write().unwrap();
        {
            let mut entries = txn.open_table(USER_ENTRIES).unwrap();
            entries.insert(8u64, b"orphan entry list".as_slice()).unwrap();
        }
        txn.commit().unwrap();
        assert!(db.load_state(8).unwrap().is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stores.redb");

        {
            let db = StoreDb::open(&path).unwrap();
            db.save_state(7, b"index", b"entries").unwrap();
        }

        {
            let db = StoreDb::open(&path).unwrap();
            let (index, entries) = db.load_state(7).unwrap().unwrap();
            assert_eq!(index, b"index");
            assert_eq!(entries, b"entries");
        }
    }
}
