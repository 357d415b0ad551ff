//! Companion retention pass. Every step archives rows to parquet, makes sure
//! the coarser aggregate that replaces them is stored, and only then deletes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use folio_core::calendar::{month_key, shift_months};
use folio_core::summary::category_totals;
use folio_core::{DailyHolding, DateRange, MonthlyCategorySummary, MonthlySnapshot, YearlySnapshot};
use folio_storage::{ArchiveStore, FinanceStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::export::{
    daily_holdings_batch, daily_snapshots_batch, export_period, monthly_snapshots_batch, transactions_batch,
    ExportTable,
};
use crate::lock::{with_run_lock, RETENTION_LOCK};

/// Window sizes in calendar months, counting the current month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily_months: u32,
    pub transaction_months: u32,
    pub monthly_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_months: 2,
            transaction_months: 4,
            monthly_months: 12,
        }
    }
}

fn months_back(months: u32) -> i32 {
    -i32::try_from(months).unwrap_or(i32::MAX)
}

impl RetentionPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            daily_months: config.daily_retention_months,
            transaction_months: config.transaction_retention_months,
            monthly_months: config.monthly_retention_months,
        }
    }

    /// First day kept at daily resolution.
    pub fn daily_floor(&self, today: NaiveDate) -> Option<NaiveDate> {
        shift_months(today, months_back(self.daily_months.max(1) - 1))
    }

    /// First day kept as individual transactions.
    pub fn transaction_floor(&self, today: NaiveDate) -> Option<NaiveDate> {
        shift_months(today, months_back(self.transaction_months.max(1) - 1))
    }

    /// Latest year whose December is older than the monthly window.
    pub fn last_rollup_year(&self, today: NaiveDate) -> Option<i32> {
        let floor = shift_months(today, months_back(self.monthly_months.max(1)))?;
        Some(floor.year() - 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub daily_months_archived: Vec<String>,
    pub daily_months_skipped: Vec<String>,
    pub daily_rows_deleted: u64,
    pub monthly_rows_derived: usize,
    pub years_archived: Vec<i32>,
    pub monthly_rows_deleted: u64,
    pub transaction_months_archived: Vec<String>,
    pub transactions_deleted: u64,
    pub category_summaries_written: usize,
}

/// Month-end rows for accounts present in `holdings`, valued from each
/// account's latest holding date in the month.
pub fn derive_monthly_from_holdings(month: NaiveDate, holdings: &[DailyHolding]) -> Vec<MonthlySnapshot> {
    let mut latest: BTreeMap<&str, NaiveDate> = BTreeMap::new();
    for holding in holdings {
        let entry = latest.entry(holding.account_id.as_str()).or_insert(holding.date);
        if holding.date > *entry {
            *entry = holding.date;
        }
    }
    latest
        .into_iter()
        .map(|(account_id, date)| MonthlySnapshot {
            month,
            account_id: account_id.to_string(),
            portfolio_value_cents: holdings
                .iter()
                .filter(|h| h.account_id == account_id && h.date == date)
                .map(|h| h.value_cents)
                .sum(),
        })
        .collect()
}

/// Year-end rows taken from each account's latest month in `rows`.
pub fn yearly_from_monthly(year: i32, rows: &[MonthlySnapshot]) -> Vec<YearlySnapshot> {
    let mut latest: BTreeMap<&str, &MonthlySnapshot> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.month.year() == year) {
        let entry = latest.entry(row.account_id.as_str()).or_insert(row);
        if row.month > entry.month {
            *entry = row;
        }
    }
    latest
        .into_values()
        .map(|row| YearlySnapshot {
            year,
            account_id: row.account_id.clone(),
            portfolio_value_cents: row.portfolio_value_cents,
            as_of_month: row.month,
        })
        .collect()
}

/// True when `stored` holds exactly the `expected` rows, compared per category.
fn summaries_match(stored: &[MonthlyCategorySummary], expected: &[MonthlyCategorySummary]) -> bool {
    let key = |summary: &MonthlyCategorySummary| (summary.month, summary.category_id);
    let stored: BTreeMap<_, _> = stored.iter().map(|summary| (key(summary), summary)).collect();
    stored.len() == expected.len() && expected.iter().all(|summary| stored.get(&key(summary)) == Some(&summary))
}

pub struct RetentionPass {
    store: Arc<dyn FinanceStore>,
    archive: ArchiveStore,
    policy: RetentionPolicy,
}

impl RetentionPass {
    pub fn new(store: Arc<dyn FinanceStore>, archive: ArchiveStore, policy: RetentionPolicy) -> Self {
        Self { store, archive, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn run(&self, now: DateTime<Utc>) -> SyncResult<RetentionReport> {
        let today = now.date_naive();
        let span = info_span!("retention", date = %today);
        with_run_lock(self.store.as_ref(), RETENTION_LOCK, now, || self.run_unlocked(today, now))
            .instrument(span)
            .await
    }

    async fn run_unlocked(&self, today: NaiveDate, now: DateTime<Utc>) -> SyncResult<RetentionReport> {
        let mut report = RetentionReport::default();
        self.roll_daily(today, now, &mut report).await?;
        self.roll_monthly(today, now, &mut report).await?;
        self.roll_transactions(today, now, &mut report).await?;
        info!(
            daily_months = report.daily_months_archived.len(),
            skipped_months = report.daily_months_skipped.len(),
            years = report.years_archived.len(),
            transaction_months = report.transaction_months_archived.len(),
            "retention pass complete"
        );
        Ok(report)
    }

    async fn roll_daily(&self, today: NaiveDate, now: DateTime<Utc>, report: &mut RetentionReport) -> SyncResult<()> {
        let Some(floor) = self.policy.daily_floor(today) else {
            return Ok(());
        };
        let Some(earliest) = self.store.earliest_daily_date().await? else {
            return Ok(());
        };
        let Some(last) = floor.pred_opt().filter(|last| earliest <= *last) else {
            return Ok(());
        };

        for month in DateRange::new(earliest, last).months() {
            let range = DateRange::month(month);
            let snapshots = self.store.list_daily_snapshots(range).await?;
            let holdings = self.store.list_daily_holdings(range).await?;
            if snapshots.is_empty() && holdings.is_empty() {
                continue;
            }
            let period = month_key(month);

            export_period(
                &self.archive,
                "daily",
                &period,
                vec![
                    ExportTable {
                        name: "daily_snapshots",
                        batch: daily_snapshots_batch(&snapshots).map_err(SyncError::Archive)?,
                    },
                    ExportTable {
                        name: "daily_holdings",
                        batch: daily_holdings_batch(&holdings).map_err(SyncError::Archive)?,
                    },
                ],
                now,
            )
            .await
            .map_err(SyncError::Archive)?;

            let existing = self.store.list_monthly_snapshots(range).await?;
            let stored: HashSet<&str> = existing.iter().map(|row| row.account_id.as_str()).collect();
            let missing = derive_monthly_from_holdings(month, &holdings)
                .into_iter()
                .filter(|row| !stored.contains(row.account_id.as_str()))
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                self.store.upsert_monthly_snapshots(&missing).await?;
                report.monthly_rows_derived += missing.len();
            }

            let confirmed = self.store.list_monthly_snapshots(range).await?;
            let covered: HashSet<&str> = confirmed.iter().map(|row| row.account_id.as_str()).collect();
            let uncovered = holdings.iter().any(|h| !covered.contains(h.account_id.as_str()));
            if confirmed.is_empty() || uncovered {
                warn!(month = %period, "no monthly rows to stand in for daily data; month kept");
                report.daily_months_skipped.push(period);
                continue;
            }

            let deleted = self.store.delete_daily_range(range).await?;
            info!(month = %period, deleted, "daily rows archived");
            report.daily_rows_deleted += deleted;
            report.daily_months_archived.push(period);
        }
        Ok(())
    }

    async fn roll_monthly(&self, today: NaiveDate, now: DateTime<Utc>, report: &mut RetentionReport) -> SyncResult<()> {
        let Some(last_year) = self.policy.last_rollup_year(today) else {
            return Ok(());
        };
        let Some(earliest) = self.store.earliest_monthly_month().await? else {
            return Ok(());
        };

        for year in earliest.year()..=last_year {
            let Some(range) = DateRange::year(year) else {
                continue;
            };
            let rows = self.store.list_monthly_snapshots(range).await?;
            if rows.is_empty() {
                continue;
            }
            let period = year.to_string();

            export_period(
                &self.archive,
                "monthly",
                &period,
                vec![ExportTable {
                    name: "monthly_snapshots",
                    batch: monthly_snapshots_batch(&rows).map_err(SyncError::Archive)?,
                }],
                now,
            )
            .await
            .map_err(SyncError::Archive)?;

            let yearly = yearly_from_monthly(year, &rows);
            self.store.upsert_yearly_snapshots(&yearly).await?;

            let confirmed = self.store.list_yearly_snapshots().await?;
            let covered: HashSet<&str> = confirmed
                .iter()
                .filter(|row| row.year == year)
                .map(|row| row.account_id.as_str())
                .collect();
            if rows.iter().any(|row| !covered.contains(row.account_id.as_str())) {
                warn!(year, "yearly rows missing after upsert; monthly rows kept");
                continue;
            }

            let deleted = self.store.delete_monthly_range(range).await?;
            info!(year, deleted, "monthly rows rolled into yearly");
            report.monthly_rows_deleted += deleted;
            report.years_archived.push(year);
        }
        Ok(())
    }

    async fn roll_transactions(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        report: &mut RetentionReport,
    ) -> SyncResult<()> {
        let Some(floor) = self.policy.transaction_floor(today) else {
            return Ok(());
        };
        let Some(earliest) = self.store.earliest_transaction_date().await? else {
            return Ok(());
        };
        let Some(last) = floor.pred_opt().filter(|last| earliest <= *last) else {
            return Ok(());
        };

        for month in DateRange::new(earliest, last).months() {
            let range = DateRange::month(month);
            let transactions = self.store.list_transactions(range).await?;
            if transactions.is_empty() {
                continue;
            }
            let period = month_key(month);

            export_period(
                &self.archive,
                "transactions",
                &period,
                vec![ExportTable {
                    name: "transactions",
                    batch: transactions_batch(&transactions).map_err(SyncError::Archive)?,
                }],
                now,
            )
            .await
            .map_err(SyncError::Archive)?;

            let summaries = category_totals(&transactions);
            self.store.replace_category_summaries(range, &summaries).await?;

            let stored = self.store.list_category_summaries(range).await?;
            if !summaries_match(&stored, &summaries) {
                warn!(month = %period, stored = stored.len(), expected = summaries.len(), "category summaries incomplete; transactions kept");
                continue;
            }

            let deleted = self.store.delete_transactions_in_range(range).await?;
            info!(month = %period, deleted, "transactions summarized");
            report.category_summaries_written += summaries.len();
            report.transactions_deleted += deleted;
            report.transaction_months_archived.push(period);
        }
        Ok(())
    }
}
