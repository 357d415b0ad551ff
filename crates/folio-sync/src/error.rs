use folio_providers::ProviderError;
use folio_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("bank sync failed for item {item_id}: {source}")]
    BankProvider {
        item_id: String,
        #[source]
        source: ProviderError,
    },
    #[error("bank link call failed: {0}")]
    Link(#[source] ProviderError),
    #[error("brokerage call failed: {0}")]
    BrokerageProvider(#[source] ProviderError),
    #[error("cursor for item {item_id} moved during sync")]
    CursorConflict { item_id: String },
    #[error("a {0} run is already in progress")]
    BatchAlreadyRunning(String),
    #[error("{0} provider is not configured")]
    NotConfigured(&'static str),
    #[error("unknown item {0}")]
    UnknownItem(String),
    #[error("no brokerage user has been registered")]
    NoBrokerageUser,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive export failed: {0:#}")]
    Archive(anyhow::Error),
}

impl SyncError {
    /// Provider failures are isolated per item or pass; everything else aborts the batch.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            SyncError::BankProvider { .. } | SyncError::BrokerageProvider(_) | SyncError::CursorConflict { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
