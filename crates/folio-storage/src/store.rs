//! Store contract consumed by the sync engine.
//!
//! Every write is either a keyed upsert or a keyed delete and is atomic on
//! its own. Nothing here spans more than one entity except `delete_item`,
//! which cascades to the item's accounts and transactions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{
    BankAccount, BankHealth, BrokerageConnection, BrokerageUser, Category, CategoryId, CategoryRule,
    DailyHolding, DailySnapshot, DateRange, Item, MonthlyCategorySummary, MonthlySnapshot, Transaction,
    YearlySnapshot,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid value in {table}.{column}: {message}")]
    InvalidData {
        table: &'static str,
        column: &'static str,
        message: String,
    },
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Category definition as it appears in seed configuration, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCategory {
    pub name: String,
    pub provider_alias: Option<String>,
    pub expense: bool,
}

#[async_trait]
pub trait FinanceStore: Send + Sync {
    async fn upsert_item(&self, item: &Item) -> StoreResult<()>;
    async fn get_item(&self, item_id: &str) -> StoreResult<Option<Item>>;
    async fn list_items(&self) -> StoreResult<Vec<Item>>;
    /// Items that are pending or unhealthy, ordered by id.
    async fn list_items_for_run(&self) -> StoreResult<Vec<Item>>;
    /// Removes the item with its accounts and their transactions. Returns false if absent.
    async fn delete_item(&self, item_id: &str) -> StoreResult<bool>;
    /// Returns false when no such item exists.
    async fn set_item_pending(&self, item_id: &str, pending: bool) -> StoreResult<bool>;
    async fn set_item_status(&self, item_id: &str, status: BankHealth, now: DateTime<Utc>) -> StoreResult<()>;
    /// Compare-and-swap commit of a completed sync pass: stores `next_cursor`,
    /// clears `pending` and marks the item healthy, but only if the stored
    /// cursor still equals `expected_cursor`. Returns whether the swap happened.
    async fn commit_item_sync(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        next_cursor: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn upsert_bank_accounts(&self, accounts: &[BankAccount]) -> StoreResult<()>;
    async fn list_bank_accounts(&self, item_id: Option<&str>) -> StoreResult<Vec<BankAccount>>;

    /// Upserts by name and returns the category id.
    async fn upsert_category(&self, category: &NewCategory) -> StoreResult<CategoryId>;
    async fn list_categories(&self) -> StoreResult<Vec<Category>>;
    async fn upsert_category_rule(&self, rule: &CategoryRule) -> StoreResult<()>;
    async fn list_category_rules(&self) -> StoreResult<Vec<CategoryRule>>;

    async fn upsert_transactions(&self, transactions: &[Transaction]) -> StoreResult<()>;
    /// Keyed delete by external id; unknown ids are ignored. Returns rows removed.
    async fn delete_transactions(&self, external_ids: &[String]) -> StoreResult<u64>;
    async fn list_transactions(&self, range: DateRange) -> StoreResult<Vec<Transaction>>;
    async fn delete_transactions_in_range(&self, range: DateRange) -> StoreResult<u64>;
    async fn earliest_transaction_date(&self) -> StoreResult<Option<NaiveDate>>;

    async fn get_brokerage_user(&self) -> StoreResult<Option<BrokerageUser>>;
    async fn save_brokerage_user(&self, user: &BrokerageUser) -> StoreResult<()>;
    async fn upsert_brokerage_connection(&self, connection: &BrokerageConnection) -> StoreResult<()>;
    async fn list_brokerage_connections(&self) -> StoreResult<Vec<BrokerageConnection>>;
    async fn delete_brokerage_connection(&self, connection_id: &str) -> StoreResult<bool>;

    async fn upsert_daily_snapshot(&self, snapshot: &DailySnapshot) -> StoreResult<()>;
    async fn upsert_daily_holdings(&self, holdings: &[DailyHolding]) -> StoreResult<()>;
    async fn list_daily_snapshots(&self, range: DateRange) -> StoreResult<Vec<DailySnapshot>>;
    async fn list_daily_holdings(&self, range: DateRange) -> StoreResult<Vec<DailyHolding>>;
    /// Deletes daily snapshots and daily holdings inside `range`.
    async fn delete_daily_range(&self, range: DateRange) -> StoreResult<u64>;
    async fn earliest_daily_date(&self) -> StoreResult<Option<NaiveDate>>;

    async fn upsert_monthly_snapshots(&self, snapshots: &[MonthlySnapshot]) -> StoreResult<()>;
    async fn list_monthly_snapshots(&self, range: DateRange) -> StoreResult<Vec<MonthlySnapshot>>;
    async fn delete_monthly_range(&self, range: DateRange) -> StoreResult<u64>;
    async fn earliest_monthly_month(&self) -> StoreResult<Option<NaiveDate>>;

    async fn upsert_yearly_snapshots(&self, snapshots: &[YearlySnapshot]) -> StoreResult<()>;
    async fn list_yearly_snapshots(&self) -> StoreResult<Vec<YearlySnapshot>>;

    /// Replaces every summary whose month falls in `range` with `summaries`.
    async fn replace_category_summaries(
        &self,
        range: DateRange,
        summaries: &[MonthlyCategorySummary],
    ) -> StoreResult<()>;
    async fn list_category_summaries(&self, range: DateRange) -> StoreResult<Vec<MonthlyCategorySummary>>;

    /// Takes the named run lock unless another holder took it less than
    /// `stale_after` ago. Returns the lease's `acquired_at`, which
    /// `unlock_run` needs to release it.
    async fn try_lock_run(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<Option<DateTime<Utc>>>;
    /// Releases the lock only while it is still held under `lease`; a lease
    /// already taken over by another run is left alone.
    async fn unlock_run(&self, name: &str, lease: DateTime<Utc>) -> StoreResult<()>;
}
