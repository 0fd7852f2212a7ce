//! Consistency policy between the authoritative document store and the
//! per-user vector index.
//!
//! The document record is always committed or deleted first; the index is
//! a best-effort mirror. [`index_after_commit`] and [`remove_after_delete`]
//! are phase two of that contract: their failures are logged and degrade
//! search freshness, but never roll back or fail the authoritative action.
//! [`reindex_user`] is the documented recovery procedure for detected
//! drift.

use tracing::{info, warn};

use crate::{
    embedder::EmbeddingProvider,
    error::Result,
    store::StoreManager,
};

/// A document as the authoritative store holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub document_id: u64,
    pub title: String,
    pub content: String,
}

/// Read-only view of the authoritative document store.
///
/// The index mirrors a subset of these documents and consults this trait
/// to detect and repair drift.
pub trait DocumentSource {
    /// Whether the document currently exists for this user.
    fn exists(&self, user_id: u64, document_id: u64) -> bool;

    /// All of a user's current documents, for full reindexing.
    fn documents_for(&self, user_id: u64) -> Vec<SourceDocument>;
}

/// Index a document after its authoritative record has been committed.
///
/// Best-effort: embedding or persistence failures are logged and reported
/// as `false`. The document stays visible through direct lookup either
/// way; it just does not appear in search results until a reindex.
pub fn index_after_commit(
    store: &StoreManager,
    embedder: &dyn EmbeddingProvider,
    user_id: u64,
    document_id: u64,
    title: &str,
    content: &str,
) -> bool {
    let embedding = match embedder.embed(content) {
        Ok(embedding) => embedding,
        Err(err) => {
            warn!(
                user_id,
                document_id,
                %err,
                "embedding failed, document will not be searchable until reindexed"
            );
            return false;
        }
    };

    match store.add_document(user_id, document_id, title, content, &embedding)
    {
        Ok(()) => true,
        Err(err) => {
            warn!(
                user_id,
                document_id,
                %err,
                persistence = err.is_persistence(),
                "index write failed after document commit"
            );
            false
        }
    }
}

/// Remove a document from the index after its authoritative record has
/// been deleted.
///
/// Best-effort: on failure the stale vector stays in the index, which is
/// tolerated because search hits are cross-checked against the
/// authoritative store. Returns `true` only if an indexed entry was
/// actually removed.
pub fn remove_after_delete(
    store: &StoreManager,
    user_id: u64,
    document_id: u64,
) -> bool {
    match store.remove_document(user_id, document_id) {
        Ok(removed) => removed,
        Err(err) => {
            warn!(
                user_id,
                document_id,
                %err,
                "index removal failed, stale vector will be filtered at search time"
            );
            false
        }
    }
}

/// Rebuild a user's entire index from their current authoritative
/// documents.
///
/// This is the recovery procedure for detected drift: every document is
/// re-embedded in one batch, then the existing state is dropped and the
/// index rebuilt in document order. The old index is only destroyed once
/// the replacement embeddings are in hand, so a failed recovery leaves it
/// as it was. Unlike the best-effort paths, errors propagate — a recovery
/// that failed must not look like one that succeeded. Returns the number
/// of indexed documents.
pub fn reindex_user(
    store: &StoreManager,
    embedder: &dyn EmbeddingProvider,
    source: &dyn DocumentSource,
    user_id: u64,
) -> Result<usize> {
    let documents = source.documents_for(user_id);

    if documents.is_empty() {
        store.drop_user(user_id)?;
        info!(user_id, "reindex: user has no documents");
        return Ok(0);
    }

    // Embed before touching the existing state: if the model is down, the
    // drifted index stays serviceable instead of being destroyed mid-recovery.
    let texts: Vec<String> =
        documents.iter().map(|d| d.content.clone()).collect();
    let embeddings = embedder.embed_batch(&texts)?;

    store.drop_user(user_id)?;

    for (document, embedding) in documents.iter().zip(embeddings.iter()) {
        store.add_document(
            user_id,
            document.document_id,
            &document.title,
            &document.content,
            embedding,
        )?;
    }

    info!(user_id, documents = documents.len(), "reindex complete");
    Ok(documents.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    /// Embedder that hashes text bytes into a deterministic 2-dim vector,
    /// or fails when `available` is false.
    struct FlakyEmbedder {
        available: bool,
    }

    impl EmbeddingProvider for FlakyEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if !self.available {
                return Err(Error::ModelUnavailable("down for test".into()));
            }
            let sum: u32 = text.bytes().map(u32::from).sum();
            Ok(vec![(sum % 97) as f32, (sum % 89) as f32])
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn dimension(&self) -> Result<usize> {
            if self.available {
                Ok(2)
            } else {
                Err(Error::ModelUnavailable("down for test".into()))
            }
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    struct FixedSource {
        documents: Vec<SourceDocument>,
    }

    impl DocumentSource for FixedSource {
        fn exists(&self, _user_id: u64, document_id: u64) -> bool {
            self.documents.iter().any(|d| d.document_id == document_id)
        }

        fn documents_for(&self, _user_id: u64) -> Vec<SourceDocument> {
            self.documents.clone()
        }
    }

    fn test_store() -> (tempfile::TempDir, StoreManager) {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            StoreManager::open(&tmp.path().join("stores.redb")).unwrap();
        (tmp, store)
    }

    fn doc(document_id: u64, title: &str) -> SourceDocument {
        SourceDocument {
            document_id,
            title: title.to_string(),
            content: format!("{title} content"),
        }
    }

    #[test]
    fn index_after_commit_adds_document() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: true };

        assert!(index_after_commit(&store, &embedder, 1, 10, "t", "text"));
        assert_eq!(store.document_count(1).unwrap(), 1);
    }

    #[test]
    fn index_after_commit_swallows_embedding_failure() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: false };

        assert!(!index_after_commit(&store, &embedder, 1, 10, "t", "text"));
        assert_eq!(store.document_count(1).unwrap(), 0);
    }

    #[test]
    fn remove_after_delete_removes_indexed_entry() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: true };
        index_after_commit(&store, &embedder, 1, 10, "t", "text");

        assert!(remove_after_delete(&store, 1, 10));
        assert_eq!(store.document_count(1).unwrap(), 0);
    }

    #[test]
    fn remove_after_delete_tolerates_missing_entry() {
        let (_tmp, store) = test_store();
        assert!(!remove_after_delete(&store, 1, 999));
    }

    #[test]
    fn reindex_rebuilds_from_authoritative_documents() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: true };

        // Index one stale document, then reindex from a source that has
        // two different ones.
        index_after_commit(&store, &embedder, 1, 99, "stale", "old text");
        let source = FixedSource {
            documents: vec![doc(10, "first"), doc(20, "second")],
        };

        let count = reindex_user(&store, &embedder, &source, 1).unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.document_count(1).unwrap(), 2);

        let query = embedder.embed("first content").unwrap();
        let results = store.search(1, &query, 3).unwrap();
        assert!(results.iter().all(|(e, _)| e.document_id != 99));
    }

    #[test]
    fn reindex_with_no_documents_clears_state() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: true };
        index_after_commit(&store, &embedder, 1, 10, "t", "text");

        let source = FixedSource {
            documents: Vec::new(),
        };
        let count = reindex_user(&store, &embedder, &source, 1).unwrap();
        assert_eq!(count, 0);
        assert_eq!(store.document_count(1).unwrap(), 0);
    }

    #[test]
    fn reindex_propagates_embedding_failure() {
        let (_tmp, store) = test_store();
        let embedder = FlakyEmbedder { available: false };
        let source = FixedSource {
            documents: vec![doc(10, "first")],
        };

        let err = reindex_user(&store, &embedder, &source, 1).unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    #[test]
    fn failed_reindex_preserves_existing_index() {
        let (_tmp, store) = test_store();
        let good = FlakyEmbedder { available: true };
        index_after_commit(&store, &good, 1, 10, "t", "text");

        // The model goes down before the recovery runs.
        let bad = FlakyEmbedder { available: false };
        let source = FixedSource {
            documents: vec![doc(20, "fresh")],
        };
        assert!(reindex_user(&store, &bad, &source, 1).is_err());

        // The drifted-but-serviceable index is untouched.
        assert_eq!(store.document_count(1).unwrap(), 1);
        let query = good.embed("text").unwrap();
        let results = store.search(1, &query, 1).unwrap();
        assert_eq!(results[0].0.document_id, 10);
    }
}
