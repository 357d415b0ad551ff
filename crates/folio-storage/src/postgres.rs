//! Postgres-backed `FinanceStore`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{
    BankAccount, BankHealth, BrokerageConnection, BrokerageHealth, BrokerageUser, Category, CategoryId,
    CategoryRule, DailyHolding, DailySnapshot, DateRange, Item, MonthlyCategorySummary, MonthlySnapshot,
    Transaction, YearlySnapshot,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{FinanceStore, NewCategory, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn item_from_row(row: &PgRow) -> StoreResult<Item> {
    let status: String = row.try_get("status")?;
    Ok(Item {
        item_id: row.try_get("item_id")?,
        access_token: row.try_get("access_token")?,
        institution_id: row.try_get("institution_id")?,
        institution_name: row.try_get("institution_name")?,
        status: status.parse::<BankHealth>().map_err(|err| StoreError::InvalidData {
            table: "items",
            column: "status",
            message: err.to_string(),
        })?,
        cursor: row.try_get("cursor")?,
        pending: row.try_get("pending")?,
        last_updated: row.try_get("last_updated")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> StoreResult<Transaction> {
    Ok(Transaction {
        external_id: row.try_get("external_id")?,
        account_id: row.try_get("account_id")?,
        date: row.try_get("date")?,
        amount_cents: row.try_get("amount_cents")?,
        name: row.try_get("name")?,
        merchant_name: row.try_get("merchant_name")?,
        category_id: row.try_get("category_id")?,
        pending: row.try_get("pending")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const ITEM_COLUMNS: &str = "item_id, access_token, institution_id, institution_name, status, cursor, pending, last_updated, last_synced_at";

#[async_trait]
impl FinanceStore for PgStore {
    async fn upsert_item(&self, item: &Item) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO items (item_id, access_token, institution_id, institution_name, status, cursor, pending, last_updated, last_synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (item_id) DO UPDATE
               SET access_token = EXCLUDED.access_token,
                   institution_id = EXCLUDED.institution_id,
                   institution_name = EXCLUDED.institution_name,
                   status = EXCLUDED.status,
                   cursor = EXCLUDED.cursor,
                   pending = EXCLUDED.pending,
                   last_updated = EXCLUDED.last_updated,
                   last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(&item.item_id)
        .bind(&item.access_token)
        .bind(&item.institution_id)
        .bind(&item.institution_name)
        .bind(item.status.as_str())
        .bind(&item.cursor)
        .bind(item.pending)
        .bind(item.last_updated)
        .bind(item.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> StoreResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_id = $1"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn list_items(&self) -> StoreResult<Vec<Item>> {
        let rows = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY item_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn list_items_for_run(&self) -> StoreResult<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE pending OR status <> 'OK' ORDER BY item_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn delete_item(&self, item_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM transactions
             WHERE account_id IN (SELECT account_id FROM bank_accounts WHERE item_id = $1)
            "#,
        )
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM bank_accounts WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM items WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_item_pending(&self, item_id: &str, pending: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE items SET pending = $2, last_updated = NOW() WHERE item_id = $1")
            .bind(item_id)
            .bind(pending)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_item_status(&self, item_id: &str, status: BankHealth, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE items SET status = $2, last_updated = $3 WHERE item_id = $1")
            .bind(item_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_item_sync(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        next_cursor: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items
               SET cursor = $3,
                   pending = FALSE,
                   status = 'OK',
                   last_synced_at = $4,
                   last_updated = $4
             WHERE item_id = $1
               AND cursor IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(item_id)
        .bind(expected_cursor)
        .bind(next_cursor)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_bank_accounts(&self, accounts: &[BankAccount]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for account in accounts {
            sqlx::query(
                r#"
                INSERT INTO bank_accounts (account_id, item_id, name, mask, account_type, subtype, current_balance_cents)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (account_id) DO UPDATE
                   SET item_id = EXCLUDED.item_id,
                       name = EXCLUDED.name,
                       mask = EXCLUDED.mask,
                       account_type = EXCLUDED.account_type,
                       subtype = EXCLUDED.subtype,
                       current_balance_cents = EXCLUDED.current_balance_cents
                "#,
            )
            .bind(&account.account_id)
            .bind(&account.item_id)
            .bind(&account.name)
            .bind(&account.mask)
            .bind(&account.account_type)
            .bind(&account.subtype)
            .bind(account.current_balance_cents)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_bank_accounts(&self, item_id: Option<&str>) -> StoreResult<Vec<BankAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, item_id, name, mask, account_type, subtype, current_balance_cents
              FROM bank_accounts
             WHERE $1::text IS NULL OR item_id = $1
             ORDER BY account_id
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(BankAccount {
                    account_id: row.try_get("account_id")?,
                    item_id: row.try_get("item_id")?,
                    name: row.try_get("name")?,
                    mask: row.try_get("mask")?,
                    account_type: row.try_get("account_type")?,
                    subtype: row.try_get("subtype")?,
                    current_balance_cents: row.try_get("current_balance_cents")?,
                })
            })
            .collect()
    }

    async fn upsert_category(&self, category: &NewCategory) -> StoreResult<CategoryId> {
        let row = sqlx::query(
            r#"
            INSERT INTO categories (name, provider_alias, expense)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
               SET provider_alias = EXCLUDED.provider_alias,
                   expense = EXCLUDED.expense
            RETURNING id
            "#,
        )
        .bind(&category.name)
        .bind(&category.provider_alias)
        .bind(category.expense)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        let rows = sqlx::query("SELECT id, name, provider_alias, expense FROM categories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Category {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    provider_alias: row.try_get("provider_alias")?,
                    expense: row.try_get("expense")?,
                })
            })
            .collect()
    }

    async fn upsert_category_rule(&self, rule: &CategoryRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO category_rules (id, match_text, category_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET match_text = EXCLUDED.match_text,
                   category_id = EXCLUDED.category_id
            "#,
        )
        .bind(rule.id)
        .bind(&rule.match_text)
        .bind(rule.category_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_category_rules(&self) -> StoreResult<Vec<CategoryRule>> {
        let rows = sqlx::query("SELECT id, match_text, category_id FROM category_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CategoryRule {
                    id: row.try_get("id")?,
                    match_text: row.try_get("match_text")?,
                    category_id: row.try_get("category_id")?,
                })
            })
            .collect()
    }

    async fn upsert_transactions(&self, transactions: &[Transaction]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for txn in transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (external_id, account_id, date, amount_cents, name, merchant_name, category_id, pending, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (external_id) DO UPDATE
                   SET account_id = EXCLUDED.account_id,
                       date = EXCLUDED.date,
                       amount_cents = EXCLUDED.amount_cents,
                       name = EXCLUDED.name,
                       merchant_name = EXCLUDED.merchant_name,
                       category_id = EXCLUDED.category_id,
                       pending = EXCLUDED.pending,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&txn.external_id)
            .bind(&txn.account_id)
            .bind(txn.date)
            .bind(txn.amount_cents)
            .bind(&txn.name)
            .bind(&txn.merchant_name)
            .bind(txn.category_id)
            .bind(txn.pending)
            .bind(txn.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_transactions(&self, external_ids: &[String]) -> StoreResult<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM transactions WHERE external_id = ANY($1)")
            .bind(external_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_transactions(&self, range: DateRange) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, account_id, date, amount_cents, name, merchant_name, category_id, pending, updated_at
              FROM transactions
             WHERE date BETWEEN $1 AND $2
             ORDER BY date, external_id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn delete_transactions_in_range(&self, range: DateRange) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM transactions WHERE date BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn earliest_transaction_date(&self) -> StoreResult<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MIN(date) AS earliest FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("earliest")?)
    }

    async fn get_brokerage_user(&self) -> StoreResult<Option<BrokerageUser>> {
        let row = sqlx::query("SELECT user_id, user_secret FROM brokerage_users ORDER BY created_at LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(BrokerageUser {
                user_id: row.try_get("user_id")?,
                user_secret: row.try_get("user_secret")?,
            })
        })
        .transpose()
    }

    async fn save_brokerage_user(&self, user: &BrokerageUser) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO brokerage_users (user_id, user_secret)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET user_secret = EXCLUDED.user_secret
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.user_secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_brokerage_connection(&self, connection: &BrokerageConnection) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO brokerage_connections (connection_id, brokerage, status, last_checked)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (connection_id) DO UPDATE
               SET brokerage = EXCLUDED.brokerage,
                   status = EXCLUDED.status,
                   last_checked = EXCLUDED.last_checked
            "#,
        )
        .bind(&connection.connection_id)
        .bind(&connection.brokerage)
        .bind(connection.status.as_str())
        .bind(connection.last_checked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_brokerage_connections(&self) -> StoreResult<Vec<BrokerageConnection>> {
        let rows = sqlx::query(
            "SELECT connection_id, brokerage, status, last_checked FROM brokerage_connections ORDER BY connection_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(BrokerageConnection {
                    connection_id: row.try_get("connection_id")?,
                    brokerage: row.try_get("brokerage")?,
                    status: status
                        .parse::<BrokerageHealth>()
                        .map_err(|err| StoreError::InvalidData {
                            table: "brokerage_connections",
                            column: "status",
                            message: err.to_string(),
                        })?,
                    last_checked: row.try_get("last_checked")?,
                })
            })
            .collect()
    }

    async fn delete_brokerage_connection(&self, connection_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM brokerage_connections WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_daily_snapshot(&self, snapshot: &DailySnapshot) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_snapshots (date, portfolio_value_cents)
            VALUES ($1, $2)
            ON CONFLICT (date) DO UPDATE SET portfolio_value_cents = EXCLUDED.portfolio_value_cents
            "#,
        )
        .bind(snapshot.date)
        .bind(snapshot.portfolio_value_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_daily_holdings(&self, holdings: &[DailyHolding]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for holding in holdings {
            sqlx::query(
                r#"
                INSERT INTO daily_holdings (date, account_id, symbol, quantity, value_cents)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (date, account_id, symbol) DO UPDATE
                   SET quantity = EXCLUDED.quantity,
                       value_cents = EXCLUDED.value_cents
                "#,
            )
            .bind(holding.date)
            .bind(&holding.account_id)
            .bind(&holding.symbol)
            .bind(holding.quantity)
            .bind(holding.value_cents)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_daily_snapshots(&self, range: DateRange) -> StoreResult<Vec<DailySnapshot>> {
        let rows = sqlx::query(
            "SELECT date, portfolio_value_cents FROM daily_snapshots WHERE date BETWEEN $1 AND $2 ORDER BY date",
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DailySnapshot {
                    date: row.try_get("date")?,
                    portfolio_value_cents: row.try_get("portfolio_value_cents")?,
                })
            })
            .collect()
    }

    async fn list_daily_holdings(&self, range: DateRange) -> StoreResult<Vec<DailyHolding>> {
        let rows = sqlx::query(
            r#"
            SELECT date, account_id, symbol, quantity, value_cents
              FROM daily_holdings
             WHERE date BETWEEN $1 AND $2
             ORDER BY date, account_id, symbol
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DailyHolding {
                    date: row.try_get("date")?,
                    account_id: row.try_get("account_id")?,
                    symbol: row.try_get("symbol")?,
                    quantity: row.try_get("quantity")?,
                    value_cents: row.try_get("value_cents")?,
                })
            })
            .collect()
    }

    async fn delete_daily_range(&self, range: DateRange) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let holdings = sqlx::query("DELETE FROM daily_holdings WHERE date BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *tx)
            .await?;
        let snapshots = sqlx::query("DELETE FROM daily_snapshots WHERE date BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(holdings.rows_affected() + snapshots.rows_affected())
    }

    async fn earliest_daily_date(&self) -> StoreResult<Option<NaiveDate>> {
        let row = sqlx::query(
            r#"
            SELECT LEAST(
                (SELECT MIN(date) FROM daily_snapshots),
                (SELECT MIN(date) FROM daily_holdings)
            ) AS earliest
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("earliest")?)
    }

    async fn upsert_monthly_snapshots(&self, snapshots: &[MonthlySnapshot]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO monthly_snapshots (month, account_id, portfolio_value_cents)
                VALUES ($1, $2, $3)
                ON CONFLICT (month, account_id) DO UPDATE
                   SET portfolio_value_cents = EXCLUDED.portfolio_value_cents
                "#,
            )
            .bind(snapshot.month)
            .bind(&snapshot.account_id)
            .bind(snapshot.portfolio_value_cents)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_monthly_snapshots(&self, range: DateRange) -> StoreResult<Vec<MonthlySnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT month, account_id, portfolio_value_cents
              FROM monthly_snapshots
             WHERE month BETWEEN $1 AND $2
             ORDER BY month, account_id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MonthlySnapshot {
                    month: row.try_get("month")?,
                    account_id: row.try_get("account_id")?,
                    portfolio_value_cents: row.try_get("portfolio_value_cents")?,
                })
            })
            .collect()
    }

    async fn delete_monthly_range(&self, range: DateRange) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM monthly_snapshots WHERE month BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn earliest_monthly_month(&self) -> StoreResult<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MIN(month) AS earliest FROM monthly_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("earliest")?)
    }

    async fn upsert_yearly_snapshots(&self, snapshots: &[YearlySnapshot]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO yearly_snapshots (year, account_id, portfolio_value_cents, as_of_month)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (year, account_id) DO UPDATE
                   SET portfolio_value_cents = EXCLUDED.portfolio_value_cents,
                       as_of_month = EXCLUDED.as_of_month
                "#,
            )
            .bind(snapshot.year)
            .bind(&snapshot.account_id)
            .bind(snapshot.portfolio_value_cents)
            .bind(snapshot.as_of_month)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_yearly_snapshots(&self) -> StoreResult<Vec<YearlySnapshot>> {
        let rows = sqlx::query(
            "SELECT year, account_id, portfolio_value_cents, as_of_month FROM yearly_snapshots ORDER BY year, account_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(YearlySnapshot {
                    year: row.try_get("year")?,
                    account_id: row.try_get("account_id")?,
                    portfolio_value_cents: row.try_get("portfolio_value_cents")?,
                    as_of_month: row.try_get("as_of_month")?,
                })
            })
            .collect()
    }

    async fn replace_category_summaries(
        &self,
        range: DateRange,
        summaries: &[MonthlyCategorySummary],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM monthly_category_summaries WHERE month BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *tx)
            .await?;
        for summary in summaries {
            sqlx::query(
                r#"
                INSERT INTO monthly_category_summaries (month, category_id, total_cents, transaction_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (month, (COALESCE(category_id, 0))) DO UPDATE
                   SET total_cents = EXCLUDED.total_cents,
                       transaction_count = EXCLUDED.transaction_count
                "#,
            )
            .bind(summary.month)
            .bind(summary.category_id)
            .bind(summary.total_cents)
            .bind(summary.transaction_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_category_summaries(&self, range: DateRange) -> StoreResult<Vec<MonthlyCategorySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT month, category_id, total_cents, transaction_count
              FROM monthly_category_summaries
             WHERE month BETWEEN $1 AND $2
             ORDER BY month, category_id NULLS FIRST
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MonthlyCategorySummary {
                    month: row.try_get("month")?,
                    category_id: row.try_get("category_id")?,
                    total_cents: row.try_get("total_cents")?,
                    transaction_count: row.try_get("transaction_count")?,
                })
            })
            .collect()
    }

    async fn try_lock_run(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let row = sqlx::query(
            r#"
            INSERT INTO run_locks (name, acquired_at)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET acquired_at = EXCLUDED.acquired_at
             WHERE run_locks.acquired_at < $3
            RETURNING acquired_at
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(now - stale_after)
        .fetch_optional(&self.pool)
        .await?;
        let lease = row
            .map(|row| row.try_get::<DateTime<Utc>, _>("acquired_at"))
            .transpose()?;
        Ok(lease)
    }

    async fn unlock_run(&self, name: &str, lease: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("DELETE FROM run_locks WHERE name = $1 AND acquired_at = $2")
            .bind(name)
            .bind(lease)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
