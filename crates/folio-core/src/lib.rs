//! Core domain model for Folio: linked items, transactions, categories and
//! the time-bucketed portfolio snapshots the sync engine maintains.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod calendar;
pub mod categorize;
pub mod health;
pub mod summary;

pub use calendar::DateRange;
pub use categorize::CategoryResolver;
pub use health::{BankHealth, BrokerageHealth};

pub const CRATE_NAME: &str = "folio-core";

/// Name of the distinguished fallback category.
pub const UNCATEGORIZED: &str = "Uncategorized";
pub const INVESTMENTS: &str = "Investments";
pub const TRANSFER: &str = "Transfer";

/// Symbol used for the uninvested remainder of a brokerage account balance.
pub const CASH_SYMBOL: &str = "$CASH";

pub type CategoryId = i64;

/// One linked bank/credit connection at the bank aggregator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub access_token: String,
    pub institution_id: Option<String>,
    pub institution_name: Option<String>,
    pub status: BankHealth,
    /// Opaque change-stream position; `None` means the item was never synced.
    pub cursor: Option<String>,
    /// Set by webhook receipt, cleared only by a completed sync pass.
    pub pending: bool,
    pub last_updated: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(item_id: impl Into<String>, access_token: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.into(),
            access_token: access_token.into(),
            institution_id: None,
            institution_name: None,
            status: BankHealth::Ok,
            cursor: None,
            pending: false,
            last_updated: now,
            last_synced_at: None,
        }
    }

    /// Pending items owe a sync pass; unhealthy ones owe a status recheck.
    pub fn is_due_for_run(&self) -> bool {
        self.pending || self.status != BankHealth::Ok
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("item_id", &self.item_id)
            .field("access_token", &"<redacted>")
            .field("institution_id", &self.institution_id)
            .field("institution_name", &self.institution_name)
            .field("status", &self.status)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending)
            .field("last_updated", &self.last_updated)
            .field("last_synced_at", &self.last_synced_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub account_id: String,
    pub item_id: String,
    pub name: String,
    pub mask: Option<String>,
    pub account_type: String,
    pub subtype: Option<String>,
    pub current_balance_cents: i64,
}

/// Persisted transaction. `amount_cents` keeps the bank aggregator's sign
/// convention: negative is an inflow, positive an outflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub external_id: String,
    pub account_id: String,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub name: String,
    pub merchant_name: Option<String>,
    pub category_id: Option<CategoryId>,
    pub pending: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    /// Bank aggregator primary-category string this category stands in for.
    pub provider_alias: Option<String>,
    /// Whether outflows in this category count as spending.
    pub expense: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub id: i64,
    /// Case-insensitive substring matched against name and merchant name.
    pub match_text: String,
    pub category_id: CategoryId,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerageUser {
    pub user_id: String,
    pub user_secret: String,
}

impl fmt::Debug for BrokerageUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerageUser")
            .field("user_id", &self.user_id)
            .field("user_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerageConnection {
    pub connection_id: String,
    pub brokerage: String,
    pub status: BrokerageHealth,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Investments-only portfolio total for one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub portfolio_value_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHolding {
    pub date: NaiveDate,
    pub account_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub value_cents: i64,
}

/// Month-end value of one account. `month` is always the first day of the month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySnapshot {
    pub month: NaiveDate,
    pub account_id: String,
    pub portfolio_value_cents: i64,
}

/// Year-end value of one account, taken from the latest monthly row of that year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearlySnapshot {
    pub year: i32,
    pub account_id: String,
    pub portfolio_value_cents: i64,
    pub as_of_month: NaiveDate,
}

/// Per-category rollup of transactions that aged out of the retention window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyCategorySummary {
    pub month: NaiveDate,
    pub category_id: Option<CategoryId>,
    pub total_cents: i64,
    pub transaction_count: i64,
}

/// Converts a provider decimal amount into minor units.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}
