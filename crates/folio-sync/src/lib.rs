//! Sync engine: cursor sync, connection health, snapshots, retention, the
//! nightly batch that ties them together and the portfolio read side.

pub mod config;
pub mod error;
pub mod export;
pub mod health;
pub mod links;
pub mod lock;
pub mod orchestrator;
pub mod portfolio;
pub mod retention;
pub mod rules;
pub mod scheduler;
pub mod snapshots;
pub mod transactions;

pub use config::{Providers, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use health::{BrokerageCheck, HealthMonitor};
pub use links::{mark_item_pending, Institution, LinkManager};
pub use orchestrator::{BatchFailure, BatchOrchestrator, BatchSummary};
pub use portfolio::{holdings_history, portfolio_history, HoldingFilter, PortfolioHistory, PortfolioPoint};
pub use retention::{RetentionPass, RetentionPolicy, RetentionReport};
pub use rules::{CategorySeed, SeedReport};
pub use scheduler::maybe_build_scheduler;
pub use snapshots::{DailyPassReport, SnapshotEngine};
pub use transactions::{CursorSyncController, ItemSyncReport};

pub const CRATE_NAME: &str = "folio-sync";
