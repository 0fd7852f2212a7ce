//! Search orchestration over a user's index.
//!
//! This is the consuming layer the store contract expects: it embeds the
//! query, runs the nearest-neighbor search, cross-checks every hit against
//! the authoritative document store (silently dropping hits for documents
//! that no longer exist), and shapes the results for answer generation.

use tracing::debug;

use crate::{
    embedder::EmbeddingProvider,
    error::Result,
    reconcile::DocumentSource,
    store::StoreManager,
};

/// Default number of results when the caller does not specify one.
pub const DEFAULT_TOP_K: usize = 3;

/// Maximum excerpt length in characters before truncation.
pub const EXCERPT_MAX_CHARS: usize = 200;

/// A ranked search hit, ready for the answer-generation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document_id: u64,
    pub title: String,
    /// Full document content, kept for LLM context assembly.
    pub content: String,
    /// Content truncated to [`EXCERPT_MAX_CHARS`] for display.
    pub excerpt: String,
    /// Squared Euclidean distance; smaller is more similar.
    pub distance: f32,
}

/// Execute a semantic search for one user.
///
/// Embeds `query`, retrieves up to `top_k` nearest documents, and drops any
/// hit whose document the authoritative store no longer has. A user with no
/// indexed documents gets an empty result. Embedding failures propagate:
/// search cannot degrade the way indexing can.
pub fn execute_search(
    store: &StoreManager,
    embedder: &dyn EmbeddingProvider,
    source: &dyn DocumentSource,
    user_id: u64,
    query: &str,
    top_k: usize,
) -> Result<Vec<SearchHit>> {
    if store.document_count(user_id)? == 0 {
        return Ok(Vec::new());
    }

    let query_embedding = embedder.embed(query)?;
    let matches = store.search(user_id, &query_embedding, top_k)?;

    let mut hits = Vec::with_capacity(matches.len());
    for (entry, distance) in matches {
        // The document record is the source of truth; the index may hold
        // stale vectors until the next rebuild.
        if !source.exists(user_id, entry.document_id) {
            debug!(
                user_id,
                document_id = entry.document_id,
                "dropping stale search hit"
            );
            continue;
        }

        hits.push(SearchHit {
            document_id: entry.document_id,
            title: entry.title,
            excerpt: make_excerpt(&entry.content),
            content: entry.content,
            distance,
        });
    }

    Ok(hits)
}

/// Truncate content to an excerpt on a character boundary.
pub fn make_excerpt(content: &str) -> String {
    match content.char_indices().nth(EXCERPT_MAX_CHARS) {
        Some((byte_idx, _)) => {
            let mut excerpt = content[..byte_idx].to_string();
            excerpt.push_str("...");
            excerpt
        }
        None => content.to_string(),
    }
}

/// Assemble hit contents into a context block for answer generation.
///
/// Each document is rendered as a titled block; blocks are separated by
/// blank lines. The LLM call itself is outside this crate.
pub fn build_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| format!("【{}】\n{}", hit.title, hit.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
