//! Persistence, archive and HTTP plumbing shared by the Folio sync engine.

pub mod archive;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use archive::{ArchiveStore, StoredFile};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestSpec, TokenBucketConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{FinanceStore, NewCategory, StoreError, StoreResult};

pub const CRATE_NAME: &str = "folio-storage";
