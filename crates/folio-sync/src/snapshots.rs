//! Daily brokerage snapshot pass with the month-end rollup folded in.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use folio_core::calendar::{is_last_day_of_month, month_start};
use folio_core::{to_cents, DailyHolding, DailySnapshot, MonthlySnapshot, CASH_SYMBOL};
use folio_providers::{BrokerageProvider, Position};
use folio_storage::FinanceStore;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPassReport {
    pub accounts: usize,
    pub holdings_written: usize,
    pub daily_snapshot_written: bool,
    pub monthly_snapshots_written: usize,
    /// Accounts whose positions could not be fetched; their balance still counts.
    pub degraded_accounts: Vec<String>,
}

impl DailyPassReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_accounts.is_empty()
    }
}

/// Holdings for one account on `date`: positions merged by symbol plus a
/// `$CASH` row for whatever part of the balance the positions do not cover.
pub fn account_holdings(date: NaiveDate, account_id: &str, total_cents: i64, positions: &[Position]) -> Vec<DailyHolding> {
    let mut by_symbol: BTreeMap<&str, (f64, i64)> = BTreeMap::new();
    for position in positions {
        let entry = by_symbol.entry(position.symbol.as_str()).or_insert((0.0, 0));
        entry.0 += position.quantity;
        entry.1 += position.value_cents;
    }

    let invested: i64 = by_symbol.values().map(|(_, value)| value).sum();
    let residual = total_cents - invested;
    if residual != 0 {
        let cash = by_symbol.entry(CASH_SYMBOL).or_insert((0.0, 0));
        cash.0 += residual as f64 / 100.0;
        cash.1 += residual;
    }

    by_symbol
        .into_iter()
        .map(|(symbol, (quantity, value_cents))| DailyHolding {
            date,
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            quantity,
            value_cents,
        })
        .collect()
}

pub struct SnapshotEngine {
    store: Arc<dyn FinanceStore>,
    provider: Arc<dyn BrokerageProvider>,
}

impl SnapshotEngine {
    pub fn new(store: Arc<dyn FinanceStore>, provider: Arc<dyn BrokerageProvider>) -> Self {
        Self { store, provider }
    }

    /// Writes today's holdings and portfolio total. On the last day of a
    /// month the per-account totals just computed also become that month's
    /// monthly rows.
    pub async fn run_daily(&self, today: NaiveDate) -> SyncResult<DailyPassReport> {
        let span = info_span!("daily_snapshot", date = %today);
        self.run_daily_inner(today).instrument(span).await
    }

    async fn run_daily_inner(&self, today: NaiveDate) -> SyncResult<DailyPassReport> {
        let mut report = DailyPassReport::default();
        let Some(user) = self.store.get_brokerage_user().await? else {
            info!("no brokerage user registered; skipping snapshot");
            return Ok(report);
        };

        let accounts = self
            .provider
            .list_accounts(&user)
            .await
            .map_err(SyncError::BrokerageProvider)?;
        if accounts.is_empty() {
            info!("no brokerage accounts; skipping snapshot");
            return Ok(report);
        }
        report.accounts = accounts.len();

        let mut totals = BTreeMap::new();
        let mut holdings = Vec::new();
        for account in &accounts {
            let total_cents = to_cents(account.balance);
            totals.insert(account.id.clone(), total_cents);

            match self.provider.list_positions(&user, &account.id).await {
                Ok(positions) => holdings.extend(account_holdings(today, &account.id, total_cents, &positions)),
                Err(err) => {
                    warn!(account_id = %account.id, error = %err, "position fetch failed; holdings skipped");
                    report.degraded_accounts.push(account.id.clone());
                }
            }
        }

        if !holdings.is_empty() {
            self.store.upsert_daily_holdings(&holdings).await?;
        }
        report.holdings_written = holdings.len();

        let portfolio_value_cents = totals.values().sum();
        self.store
            .upsert_daily_snapshot(&DailySnapshot {
                date: today,
                portfolio_value_cents,
            })
            .await?;
        report.daily_snapshot_written = true;

        if is_last_day_of_month(today) {
            let month = month_start(today);
            let monthly = totals
                .iter()
                .map(|(account_id, total)| MonthlySnapshot {
                    month,
                    account_id: account_id.clone(),
                    portfolio_value_cents: *total,
                })
                .collect::<Vec<_>>();
            self.store.upsert_monthly_snapshots(&monthly).await?;
            report.monthly_snapshots_written = monthly.len();
            info!(month = %month, accounts = monthly.len(), "month-end snapshots written");
        }

        info!(
            accounts = report.accounts,
            holdings = report.holdings_written,
            portfolio_value_cents,
            degraded = report.degraded_accounts.len(),
            "daily snapshot written"
        );
        Ok(report)
    }
}
