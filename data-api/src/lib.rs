//! Cached data-access layer over a key/range-addressable primary store.
//!
//! The [`repository::Repository`] is the entry point: typed CRUD with
//! read-through caching, schema-validated list queries with opaque page
//! tokens, and asynchronous etag publication for cache validation at the
//! item, collection and projection level.

pub mod coordinator;
pub mod etag;
pub mod outcome;
pub mod pagination;
pub mod query;
pub mod repository;

pub use coordinator::CacheCoordinator;
pub use etag::{EtagEngine, EMPTY_COLLECTION_ETAG};
pub use outcome::{Outcome, Timings};
pub use query::{Filter, FilterOp, QuerySpec, QuerySpecBuilder, SortDirection};
pub use repository::{Page, ReadOptions, Repository, DEFAULT_PAGE_SIZE};
