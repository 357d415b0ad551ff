//! Nightly batch: bank items first, then the brokerage snapshot pass.
//!
//! Provider failures stay inside the item or pass that hit them and end up
//! as health status plus an entry in the summary. Store failures abort the
//! batch, leaving cursors and pending flags for the next run.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{BrokerageHealth, CategoryResolver, Item};
use folio_providers::{BankProvider, BrokerageProvider};
use folio_storage::FinanceStore;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Providers;
use crate::error::{SyncError, SyncResult};
use crate::health::{BrokerageCheck, HealthMonitor};
use crate::lock::{with_run_lock, BATCH_LOCK};
use crate::retention::RetentionPolicy;
use crate::snapshots::SnapshotEngine;
use crate::transactions::CursorSyncController;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub scope: &'static str,
    pub target: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub run_id: String,
    pub items_synced: usize,
    pub items_rechecked: usize,
    pub items_failed: usize,
    pub daily_snapshot_written: bool,
    pub monthly_snapshots_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brokerage_check: Option<BrokerageCheck>,
    pub failures: Vec<BatchFailure>,
}

pub struct BatchOrchestrator {
    store: Arc<dyn FinanceStore>,
    bank: Option<Arc<dyn BankProvider>>,
    brokerage: Option<Arc<dyn BrokerageProvider>>,
    policy: RetentionPolicy,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<dyn FinanceStore>, providers: Providers, policy: RetentionPolicy) -> Self {
        Self {
            store,
            bank: providers.bank,
            brokerage: providers.brokerage,
            policy,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> SyncResult<BatchSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("batch", run_id = %run_id);
        with_run_lock(self.store.as_ref(), BATCH_LOCK, now, || self.run_unlocked(run_id.clone(), now))
            .instrument(span)
            .await
    }

    async fn run_unlocked(&self, run_id: String, now: DateTime<Utc>) -> SyncResult<BatchSummary> {
        let mut summary = BatchSummary {
            run_id,
            ..BatchSummary::default()
        };
        self.run_bank_items(now, &mut summary).await?;
        self.run_snapshot_pass(now, &mut summary).await?;
        info!(
            items_synced = summary.items_synced,
            items_rechecked = summary.items_rechecked,
            items_failed = summary.items_failed,
            daily_snapshot_written = summary.daily_snapshot_written,
            monthly_snapshots_written = summary.monthly_snapshots_written,
            "batch complete"
        );
        Ok(summary)
    }

    async fn run_bank_items(&self, now: DateTime<Utc>, summary: &mut BatchSummary) -> SyncResult<()> {
        let items = self.store.list_items_for_run().await?;
        if items.is_empty() {
            return Ok(());
        }
        let Some(bank) = &self.bank else {
            warn!(items = items.len(), "bank provider not configured; items left for a later run");
            return Ok(());
        };

        let resolver = CategoryResolver::new(
            &self.store.list_category_rules().await?,
            &self.store.list_categories().await?,
        );
        let floor = self.policy.transaction_floor(now.date_naive());
        let controller = CursorSyncController::new(self.store.clone(), bank.clone());
        let monitor = HealthMonitor::new(self.store.clone());

        for item in &items {
            if item.pending {
                self.sync_one(&controller, &monitor, item, &resolver, floor, now, summary)
                    .await?;
            } else {
                match monitor.recheck_bank_item(bank.as_ref(), item, now).await? {
                    Ok(_) => summary.items_rechecked += 1,
                    Err(status) => summary.failures.push(BatchFailure {
                        scope: "bank_item",
                        target: Some(item.item_id.clone()),
                        code: status.as_str().to_string(),
                        message: "item still needs reconnection".to_string(),
                    }),
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_one(
        &self,
        controller: &CursorSyncController,
        monitor: &HealthMonitor,
        item: &Item,
        resolver: &CategoryResolver,
        floor: Option<NaiveDate>,
        now: DateTime<Utc>,
        summary: &mut BatchSummary,
    ) -> SyncResult<()> {
        match controller.sync_item(item, resolver, floor, now).await {
            Ok(_) => summary.items_synced += 1,
            Err(SyncError::BankProvider { item_id, source }) => {
                monitor.record_bank_failure(item, &source, now).await?;
                summary.items_failed += 1;
                summary.failures.push(BatchFailure {
                    scope: "bank_item",
                    target: Some(item_id),
                    code: source.failure_code(),
                    message: source.to_string(),
                });
            }
            Err(err @ SyncError::CursorConflict { .. }) => {
                warn!(item_id = %item.item_id, "cursor moved underneath this run; item retried next run");
                summary.items_failed += 1;
                summary.failures.push(BatchFailure {
                    scope: "bank_item",
                    target: Some(item.item_id.clone()),
                    code: "CURSOR_CONFLICT".to_string(),
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn run_snapshot_pass(&self, now: DateTime<Utc>, summary: &mut BatchSummary) -> SyncResult<()> {
        let Some(brokerage) = &self.brokerage else {
            return Ok(());
        };
        let engine = SnapshotEngine::new(self.store.clone(), brokerage.clone());

        let mut needs_check = match engine.run_daily(now.date_naive()).await {
            Ok(report) => {
                summary.daily_snapshot_written = report.daily_snapshot_written;
                summary.monthly_snapshots_written = report.monthly_snapshots_written;
                for account_id in &report.degraded_accounts {
                    summary.failures.push(BatchFailure {
                        scope: "brokerage_positions",
                        target: Some(account_id.clone()),
                        code: "POSITIONS_UNAVAILABLE".to_string(),
                        message: "position fetch failed; holdings skipped".to_string(),
                    });
                }
                report.is_degraded()
            }
            Err(SyncError::BrokerageProvider(source)) => {
                summary.failures.push(BatchFailure {
                    scope: "brokerage",
                    target: None,
                    code: source.failure_code(),
                    message: source.to_string(),
                });
                true
            }
            Err(err) => return Err(err),
        };

        if !needs_check {
            needs_check = self
                .store
                .list_brokerage_connections()
                .await?
                .iter()
                .any(|connection| connection.status != BrokerageHealth::Ok);
        }
        if needs_check {
            if let Some(user) = self.store.get_brokerage_user().await? {
                let monitor = HealthMonitor::new(self.store.clone());
                summary.brokerage_check = Some(monitor.check_brokerage(brokerage.as_ref(), &user, now).await?);
            }
        }
        Ok(())
    }
}
