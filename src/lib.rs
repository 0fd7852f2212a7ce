//! memodex - a per-user semantic vector index for personal knowledge bases.
//!
//! memodex turns document text into dense embeddings, keeps one searchable
//! index per user, and serves exact nearest-neighbor queries with document
//! metadata. The authoritative document store lives elsewhere; this crate
//! mirrors it best-effort and reconciles when the two diverge.
//!
//! # Quick start
//!
//! ```no_run
//! use memodex::{EmbeddingProvider, FastEmbedder, StoreManager};
//!
//! let store = StoreManager::open_default().unwrap();
//! let embedder = FastEmbedder::new();
//!
//! let user_id = 1;
//! let embedding = embedder.embed("Rust is a systems language.").unwrap();
//! store
//!     .add_document(user_id, 42, "Rust notes", "Rust is a systems language.", &embedding)
//!     .unwrap();
//!
//! let query = embedder.embed("what language is good for systems?").unwrap();
//! for (entry, distance) in store.search(user_id, &query, 3).unwrap() {
//!     println!("{} (distance: {distance:.3})", entry.title);
//! }
//! ```

pub mod data_dir;
pub mod embedder;
pub mod error;
pub mod index;
pub mod reconcile;
pub mod search;
pub mod store;
pub mod store_db;

pub use data_dir::DataDir;
pub use embedder::{EmbeddingProvider, FastEmbedder};
pub use error::{Error, Result};
pub use index::VectorIndex;
pub use reconcile::{DocumentSource, SourceDocument};
pub use search::SearchHit;
pub use store::{IndexedEntry, StoreManager, UserState};
pub use store_db::StoreDb;
