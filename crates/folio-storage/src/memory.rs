//! In-process `FinanceStore` used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{
    BankAccount, BankHealth, BrokerageConnection, BrokerageUser, Category, CategoryId, CategoryRule,
    DailyHolding, DailySnapshot, DateRange, Item, MonthlyCategorySummary, MonthlySnapshot, Transaction,
    YearlySnapshot,
};
use tokio::sync::Mutex;

use crate::store::{FinanceStore, NewCategory, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<String, Item>,
    accounts: BTreeMap<String, BankAccount>,
    categories: BTreeMap<CategoryId, Category>,
    rules: BTreeMap<i64, CategoryRule>,
    transactions: BTreeMap<String, Transaction>,
    brokerage_user: Option<BrokerageUser>,
    connections: BTreeMap<String, BrokerageConnection>,
    daily: BTreeMap<NaiveDate, DailySnapshot>,
    holdings: BTreeMap<(NaiveDate, String, String), DailyHolding>,
    monthly: BTreeMap<(NaiveDate, String), MonthlySnapshot>,
    yearly: BTreeMap<(i32, String), YearlySnapshot>,
    category_summaries: BTreeMap<(NaiveDate, Option<CategoryId>), MonthlyCategorySummary>,
    run_locks: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every mutating call fails with `StoreError::WriteRejected`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self, op: &str) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(op.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FinanceStore for MemoryStore {
    async fn upsert_item(&self, item: &Item) -> StoreResult<()> {
        self.check_write("upsert_item")?;
        let mut state = self.state.lock().await;
        state.items.insert(item.item_id.clone(), item.clone());
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> StoreResult<Option<Item>> {
        Ok(self.state.lock().await.items.get(item_id).cloned())
    }

    async fn list_items(&self) -> StoreResult<Vec<Item>> {
        Ok(self.state.lock().await.items.values().cloned().collect())
    }

    async fn list_items_for_run(&self) -> StoreResult<Vec<Item>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .values()
            .filter(|item| item.is_due_for_run())
            .cloned()
            .collect())
    }

    async fn delete_item(&self, item_id: &str) -> StoreResult<bool> {
        self.check_write("delete_item")?;
        let mut state = self.state.lock().await;
        if state.items.remove(item_id).is_none() {
            return Ok(false);
        }
        let account_ids = state
            .accounts
            .values()
            .filter(|account| account.item_id == item_id)
            .map(|account| account.account_id.clone())
            .collect::<Vec<_>>();
        state.accounts.retain(|_, account| account.item_id != item_id);
        state
            .transactions
            .retain(|_, txn| !account_ids.contains(&txn.account_id));
        Ok(true)
    }

    async fn set_item_pending(&self, item_id: &str, pending: bool) -> StoreResult<bool> {
        self.check_write("set_item_pending")?;
        let mut state = self.state.lock().await;
        match state.items.get_mut(item_id) {
            Some(item) => {
                item.pending = pending;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_item_status(&self, item_id: &str, status: BankHealth, now: DateTime<Utc>) -> StoreResult<()> {
        self.check_write("set_item_status")?;
        let mut state = self.state.lock().await;
        if let Some(item) = state.items.get_mut(item_id) {
            item.status = status;
            item.last_updated = now;
        }
        Ok(())
    }

    async fn commit_item_sync(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        next_cursor: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_write("commit_item_sync")?;
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(item_id) else {
            return Ok(false);
        };
        if item.cursor.as_deref() != expected_cursor {
            return Ok(false);
        }
        item.cursor = Some(next_cursor.to_string());
        item.pending = false;
        item.status = BankHealth::Ok;
        item.last_synced_at = Some(now);
        item.last_updated = now;
        Ok(true)
    }

    async fn upsert_bank_accounts(&self, accounts: &[BankAccount]) -> StoreResult<()> {
        self.check_write("upsert_bank_accounts")?;
        let mut state = self.state.lock().await;
        for account in accounts {
            state.accounts.insert(account.account_id.clone(), account.clone());
        }
        Ok(())
    }

    async fn list_bank_accounts(&self, item_id: Option<&str>) -> StoreResult<Vec<BankAccount>> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .values()
            .filter(|account| item_id.map_or(true, |id| account.item_id == id))
            .cloned()
            .collect())
    }

    async fn upsert_category(&self, category: &NewCategory) -> StoreResult<CategoryId> {
        self.check_write("upsert_category")?;
        let mut state = self.state.lock().await;
        let existing = state
            .categories
            .values()
            .find(|c| c.name == category.name)
            .map(|c| c.id);
        let id = existing.unwrap_or_else(|| state.categories.keys().next_back().map_or(1, |max| max + 1));
        state.categories.insert(
            id,
            Category {
                id,
                name: category.name.clone(),
                provider_alias: category.provider_alias.clone(),
                expense: category.expense,
            },
        );
        Ok(id)
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        Ok(self.state.lock().await.categories.values().cloned().collect())
    }

    async fn upsert_category_rule(&self, rule: &CategoryRule) -> StoreResult<()> {
        self.check_write("upsert_category_rule")?;
        self.state.lock().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn list_category_rules(&self) -> StoreResult<Vec<CategoryRule>> {
        Ok(self.state.lock().await.rules.values().cloned().collect())
    }

    async fn upsert_transactions(&self, transactions: &[Transaction]) -> StoreResult<()> {
        self.check_write("upsert_transactions")?;
        let mut state = self.state.lock().await;
        for txn in transactions {
            state.transactions.insert(txn.external_id.clone(), txn.clone());
        }
        Ok(())
    }

    async fn delete_transactions(&self, external_ids: &[String]) -> StoreResult<u64> {
        self.check_write("delete_transactions")?;
        let mut state = self.state.lock().await;
        let removed = external_ids
            .iter()
            .filter(|id| state.transactions.remove(id.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn list_transactions(&self, range: DateRange) -> StoreResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut out = state
            .transactions
            .values()
            .filter(|txn| range.contains(txn.date))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.external_id.cmp(&b.external_id)));
        Ok(out)
    }

    async fn delete_transactions_in_range(&self, range: DateRange) -> StoreResult<u64> {
        self.check_write("delete_transactions_in_range")?;
        let mut state = self.state.lock().await;
        let before = state.transactions.len();
        state.transactions.retain(|_, txn| !range.contains(txn.date));
        Ok((before - state.transactions.len()) as u64)
    }

    async fn earliest_transaction_date(&self) -> StoreResult<Option<NaiveDate>> {
        Ok(self.state.lock().await.transactions.values().map(|txn| txn.date).min())
    }

    async fn get_brokerage_user(&self) -> StoreResult<Option<BrokerageUser>> {
        Ok(self.state.lock().await.brokerage_user.clone())
    }

    async fn save_brokerage_user(&self, user: &BrokerageUser) -> StoreResult<()> {
        self.check_write("save_brokerage_user")?;
        self.state.lock().await.brokerage_user = Some(user.clone());
        Ok(())
    }

    async fn upsert_brokerage_connection(&self, connection: &BrokerageConnection) -> StoreResult<()> {
        self.check_write("upsert_brokerage_connection")?;
        self.state
            .lock()
            .await
            .connections
            .insert(connection.connection_id.clone(), connection.clone());
        Ok(())
    }

    async fn list_brokerage_connections(&self) -> StoreResult<Vec<BrokerageConnection>> {
        Ok(self.state.lock().await.connections.values().cloned().collect())
    }

    async fn delete_brokerage_connection(&self, connection_id: &str) -> StoreResult<bool> {
        self.check_write("delete_brokerage_connection")?;
        Ok(self.state.lock().await.connections.remove(connection_id).is_some())
    }

    async fn upsert_daily_snapshot(&self, snapshot: &DailySnapshot) -> StoreResult<()> {
        self.check_write("upsert_daily_snapshot")?;
        self.state.lock().await.daily.insert(snapshot.date, *snapshot);
        Ok(())
    }

    async fn upsert_daily_holdings(&self, holdings: &[DailyHolding]) -> StoreResult<()> {
        self.check_write("upsert_daily_holdings")?;
        let mut state = self.state.lock().await;
        for holding in holdings {
            state.holdings.insert(
                (holding.date, holding.account_id.clone(), holding.symbol.clone()),
                holding.clone(),
            );
        }
        Ok(())
    }

    async fn list_daily_snapshots(&self, range: DateRange) -> StoreResult<Vec<DailySnapshot>> {
        Ok(self
            .state
            .lock()
            .await
            .daily
            .range(range.start..=range.end)
            .map(|(_, snapshot)| *snapshot)
            .collect())
    }

    async fn list_daily_holdings(&self, range: DateRange) -> StoreResult<Vec<DailyHolding>> {
        Ok(self
            .state
            .lock()
            .await
            .holdings
            .values()
            .filter(|holding| range.contains(holding.date))
            .cloned()
            .collect())
    }

    async fn delete_daily_range(&self, range: DateRange) -> StoreResult<u64> {
        self.check_write("delete_daily_range")?;
        let mut state = self.state.lock().await;
        let before = state.daily.len() + state.holdings.len();
        state.daily.retain(|date, _| !range.contains(*date));
        state.holdings.retain(|(date, _, _), _| !range.contains(*date));
        Ok((before - state.daily.len() - state.holdings.len()) as u64)
    }

    async fn earliest_daily_date(&self) -> StoreResult<Option<NaiveDate>> {
        let state = self.state.lock().await;
        let snapshot = state.daily.keys().next().copied();
        let holding = state.holdings.keys().map(|(date, _, _)| *date).min();
        Ok(match (snapshot, holding) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    async fn upsert_monthly_snapshots(&self, snapshots: &[MonthlySnapshot]) -> StoreResult<()> {
        self.check_write("upsert_monthly_snapshots")?;
        let mut state = self.state.lock().await;
        for snapshot in snapshots {
            state
                .monthly
                .insert((snapshot.month, snapshot.account_id.clone()), snapshot.clone());
        }
        Ok(())
    }

    async fn list_monthly_snapshots(&self, range: DateRange) -> StoreResult<Vec<MonthlySnapshot>> {
        Ok(self
            .state
            .lock()
            .await
            .monthly
            .values()
            .filter(|snapshot| range.contains(snapshot.month))
            .cloned()
            .collect())
    }

    async fn delete_monthly_range(&self, range: DateRange) -> StoreResult<u64> {
        self.check_write("delete_monthly_range")?;
        let mut state = self.state.lock().await;
        let before = state.monthly.len();
        state.monthly.retain(|(month, _), _| !range.contains(*month));
        Ok((before - state.monthly.len()) as u64)
    }

    async fn earliest_monthly_month(&self) -> StoreResult<Option<NaiveDate>> {
        Ok(self.state.lock().await.monthly.keys().map(|(month, _)| *month).min())
    }

    async fn upsert_yearly_snapshots(&self, snapshots: &[YearlySnapshot]) -> StoreResult<()> {
        self.check_write("upsert_yearly_snapshots")?;
        let mut state = self.state.lock().await;
        for snapshot in snapshots {
            state
                .yearly
                .insert((snapshot.year, snapshot.account_id.clone()), snapshot.clone());
        }
        Ok(())
    }

    async fn list_yearly_snapshots(&self) -> StoreResult<Vec<YearlySnapshot>> {
        Ok(self.state.lock().await.yearly.values().cloned().collect())
    }

    async fn replace_category_summaries(
        &self,
        range: DateRange,
        summaries: &[MonthlyCategorySummary],
    ) -> StoreResult<()> {
        self.check_write("replace_category_summaries")?;
        let mut state = self.state.lock().await;
        state.category_summaries.retain(|(month, _), _| !range.contains(*month));
        for summary in summaries {
            state
                .category_summaries
                .insert((summary.month, summary.category_id), summary.clone());
        }
        Ok(())
    }

    async fn list_category_summaries(&self, range: DateRange) -> StoreResult<Vec<MonthlyCategorySummary>> {
        Ok(self
            .state
            .lock()
            .await
            .category_summaries
            .values()
            .filter(|summary| range.contains(summary.month))
            .cloned()
            .collect())
    }

    async fn try_lock_run(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.check_write("try_lock_run")?;
        let mut state = self.state.lock().await;
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        match state.run_locks.get(name) {
            Some(acquired_at) if now.signed_duration_since(*acquired_at) < stale_after => Ok(None),
            _ => {
                state.run_locks.insert(name.to_string(), now);
                Ok(Some(now))
            }
        }
    }

    async fn unlock_run(&self, name: &str, lease: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.run_locks.get(name) == Some(&lease) {
            state.run_locks.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("date")
    }

    fn txn(id: &str, account_id: &str, date: NaiveDate, amount_cents: i64) -> Transaction {
        Transaction {
            external_id: id.to_string(),
            account_id: account_id.to_string(),
            date,
            amount_cents,
            name: id.to_string(),
            merchant_name: None,
            category_id: None,
            pending: false,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_is_compare_and_swap_on_cursor() {
        let store = MemoryStore::new();
        let mut item = Item::new("item-1", "token", Utc::now());
        item.pending = true;
        store.upsert_item(&item).await.expect("upsert");

        assert!(!store
            .commit_item_sync("item-1", Some("stale"), "c1", Utc::now())
            .await
            .expect("commit"));
        assert!(store
            .commit_item_sync("item-1", None, "c1", Utc::now())
            .await
            .expect("commit"));

        let stored = store.get_item("item-1").await.expect("get").expect("item");
        assert_eq!(stored.cursor.as_deref(), Some("c1"));
        assert!(!stored.pending);
        assert!(stored.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn delete_item_cascades_to_accounts_and_transactions() {
        let store = MemoryStore::new();
        store
            .upsert_item(&Item::new("item-1", "token", Utc::now()))
            .await
            .expect("item");
        store
            .upsert_bank_accounts(&[BankAccount {
                account_id: "acc-1".into(),
                item_id: "item-1".into(),
                name: "Checking".into(),
                mask: Some("0000".into()),
                account_type: "depository".into(),
                subtype: Some("checking".into()),
                current_balance_cents: 10_000,
            }])
            .await
            .expect("accounts");
        store
            .upsert_transactions(&[txn("t1", "acc-1", d(2026, 3, 1), 500), txn("t2", "acc-other", d(2026, 3, 1), 700)])
            .await
            .expect("txns");

        assert!(store.delete_item("item-1").await.expect("delete"));
        assert!(store.list_bank_accounts(None).await.expect("accounts").is_empty());
        let left = store
            .list_transactions(DateRange::month(d(2026, 3, 1)))
            .await
            .expect("txns");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].external_id, "t2");
        assert!(!store.delete_item("item-1").await.expect("delete again"));
    }

    #[tokio::test]
    async fn injected_write_failures_leave_reads_working() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .upsert_transactions(&[txn("t1", "acc", d(2026, 3, 1), 1)])
            .await
            .expect_err("write should fail");
        assert!(matches!(err, StoreError::WriteRejected(_)));
        assert!(store.list_items().await.expect("reads still work").is_empty());
        store.set_fail_writes(false);
        store
            .upsert_transactions(&[txn("t1", "acc", d(2026, 3, 1), 1)])
            .await
            .expect("write succeeds again");
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_released_or_stale() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = Duration::from_secs(2 * 60 * 60);
        assert_eq!(store.try_lock_run("daily-batch", now, stale).await.expect("lock"), Some(now));
        assert!(store.try_lock_run("daily-batch", now, stale).await.expect("lock").is_none());
        let retention = store
            .try_lock_run("retention", now, stale)
            .await
            .expect("other lock")
            .expect("lease");

        let later = now + chrono::Duration::hours(3);
        assert_eq!(store.try_lock_run("daily-batch", later, stale).await.expect("stale lock"), Some(later));

        store.unlock_run("retention", retention).await.expect("unlock");
        assert!(store.try_lock_run("retention", now, stale).await.expect("relock").is_some());
    }

    #[tokio::test]
    async fn superseded_lease_does_not_release_the_new_holder() {
        let store = MemoryStore::new();
        let stale = Duration::from_secs(2 * 60 * 60);
        let first = Utc::now();
        let overrun = store.try_lock_run("daily-batch", first, stale).await.expect("lock").expect("lease");
        let second = first + chrono::Duration::hours(3);
        let current = store.try_lock_run("daily-batch", second, stale).await.expect("takeover").expect("lease");

        store.unlock_run("daily-batch", overrun).await.expect("late release");
        let soon = second + chrono::Duration::minutes(5);
        assert!(store.try_lock_run("daily-batch", soon, stale).await.expect("still held").is_none());

        store.unlock_run("daily-batch", current).await.expect("release");
        assert!(store.try_lock_run("daily-batch", soon, stale).await.expect("free").is_some());
    }

    #[tokio::test]
    async fn categories_upsert_by_name() {
        let store = MemoryStore::new();
        let groceries = NewCategory {
            name: "Groceries".into(),
            provider_alias: None,
            expense: true,
        };
        let first = store.upsert_category(&groceries).await.expect("insert");
        let second = store
            .upsert_category(&NewCategory {
                provider_alias: Some("Food and Drink".into()),
                ..groceries
            })
            .await
            .expect("update");
        assert_eq!(first, second);
        let categories = store.list_categories().await.expect("list");
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].provider_alias.as_deref(), Some("Food and Drink"));
    }
}
