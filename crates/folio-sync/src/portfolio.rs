//! Read side of the snapshot store: recent daily values, month-end history
//! and per-position history.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use folio_core::{DailyHolding, DailySnapshot, DateRange, MonthlySnapshot};
use folio_storage::{FinanceStore, StoreResult};
use serde::Serialize;

/// Days of daily resolution returned before `today`.
pub const DAILY_HISTORY_DAYS: i64 = 30;
/// Calendar years of monthly history returned before the current one.
pub const MONTHLY_HISTORY_YEARS: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioPoint {
    pub date: NaiveDate,
    pub portfolio_value_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioHistory {
    pub daily: Vec<PortfolioPoint>,
    pub monthly: Vec<PortfolioPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingFilter {
    pub account_id: Option<String>,
    pub symbol: Option<String>,
}

impl HoldingFilter {
    fn matches(&self, holding: &DailyHolding) -> bool {
        self.account_id.as_deref().map_or(true, |id| holding.account_id == id)
            && self.symbol.as_deref().map_or(true, |symbol| holding.symbol.eq_ignore_ascii_case(symbol))
    }
}

/// Window of daily rows ending at `today`.
pub fn daily_window(today: NaiveDate) -> DateRange {
    DateRange::new(today - Duration::days(DAILY_HISTORY_DAYS), today)
}

/// Window of monthly rows, from January two years back through `today`.
pub fn monthly_window(today: NaiveDate) -> DateRange {
    let start = NaiveDate::from_ymd_opt(today.year() - MONTHLY_HISTORY_YEARS, 1, 1).unwrap_or(today);
    DateRange::new(start, today)
}

/// Portfolio total per month: the sum of every account's row for that month.
pub fn monthly_totals(rows: &[MonthlySnapshot]) -> Vec<PortfolioPoint> {
    let mut totals = BTreeMap::<NaiveDate, i64>::new();
    for row in rows {
        *totals.entry(row.month).or_default() += row.portfolio_value_cents;
    }
    totals
        .into_iter()
        .map(|(date, portfolio_value_cents)| PortfolioPoint {
            date,
            portfolio_value_cents,
        })
        .collect()
}

/// One account's month-end values.
pub fn account_monthly(rows: &[MonthlySnapshot], account_id: &str) -> Vec<PortfolioPoint> {
    let mut points = rows
        .iter()
        .filter(|row| row.account_id == account_id)
        .map(|row| PortfolioPoint {
            date: row.month,
            portfolio_value_cents: row.portfolio_value_cents,
        })
        .collect::<Vec<_>>();
    points.sort_by_key(|point| point.date);
    points
}

/// One account's daily value, summed from its holdings.
pub fn account_daily(holdings: &[DailyHolding], account_id: &str) -> Vec<PortfolioPoint> {
    let mut totals = BTreeMap::<NaiveDate, i64>::new();
    for holding in holdings.iter().filter(|holding| holding.account_id == account_id) {
        *totals.entry(holding.date).or_default() += holding.value_cents;
    }
    totals
        .into_iter()
        .map(|(date, portfolio_value_cents)| PortfolioPoint {
            date,
            portfolio_value_cents,
        })
        .collect()
}

fn daily_points(snapshots: &[DailySnapshot]) -> Vec<PortfolioPoint> {
    let mut points = snapshots
        .iter()
        .map(|snapshot| PortfolioPoint {
            date: snapshot.date,
            portfolio_value_cents: snapshot.portfolio_value_cents,
        })
        .collect::<Vec<_>>();
    points.sort_by_key(|point| point.date);
    points
}

/// Daily and monthly portfolio values. With `account_id`, both series cover
/// that account alone; otherwise they are whole-portfolio totals.
pub async fn portfolio_history(
    store: &dyn FinanceStore,
    today: NaiveDate,
    account_id: Option<&str>,
) -> StoreResult<PortfolioHistory> {
    let daily_range = daily_window(today);
    let monthly = store.list_monthly_snapshots(monthly_window(today)).await?;
    match account_id {
        Some(account_id) => {
            let holdings = store.list_daily_holdings(daily_range).await?;
            Ok(PortfolioHistory {
                daily: account_daily(&holdings, account_id),
                monthly: account_monthly(&monthly, account_id),
            })
        }
        None => {
            let daily = store.list_daily_snapshots(daily_range).await?;
            Ok(PortfolioHistory {
                daily: daily_points(&daily),
                monthly: monthly_totals(&monthly),
            })
        }
    }
}

/// Daily holdings over the recent window, optionally narrowed to one account
/// or one symbol.
pub async fn holdings_history(
    store: &dyn FinanceStore,
    today: NaiveDate,
    filter: &HoldingFilter,
) -> StoreResult<Vec<DailyHolding>> {
    let mut holdings = store
        .list_daily_holdings(daily_window(today))
        .await?
        .into_iter()
        .filter(|holding| filter.matches(holding))
        .collect::<Vec<_>>();
    holdings.sort_by(|a, b| {
        (a.date, &a.account_id, &a.symbol).cmp(&(b.date, &b.account_id, &b.symbol))
    });
    Ok(holdings)
}
