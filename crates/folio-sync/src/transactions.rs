//! Cursor-driven incremental transaction sync for one item.
//!
//! Pages are applied to the store as they arrive; upserts are keyed by the
//! external transaction id, so replaying a page after a failed run is
//! harmless. The cursor and the pending flag are only written once the whole
//! change stream has been drained, through a compare-and-swap on the cursor
//! the run started from.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use folio_core::{to_cents, CategoryResolver, Item, Transaction};
use folio_providers::{BankProvider, ProviderTransaction};
use folio_storage::FinanceStore;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSyncReport {
    pub item_id: String,
    pub pages: usize,
    pub upserted: usize,
    pub removed: u64,
    pub skipped_before_floor: usize,
    pub cursor: String,
}

pub struct CursorSyncController {
    store: Arc<dyn FinanceStore>,
    provider: Arc<dyn BankProvider>,
}

impl CursorSyncController {
    pub fn new(store: Arc<dyn FinanceStore>, provider: Arc<dyn BankProvider>) -> Self {
        Self { store, provider }
    }

    /// Drains the item's change stream starting at its stored cursor.
    /// Records dated before `retention_floor` are skipped because their
    /// month has already been folded into category summaries.
    pub async fn sync_item(
        &self,
        item: &Item,
        resolver: &CategoryResolver,
        retention_floor: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> SyncResult<ItemSyncReport> {
        let span = info_span!("item_sync", item_id = %item.item_id);
        self.drain(item, resolver, retention_floor, now).instrument(span).await
    }

    async fn drain(
        &self,
        item: &Item,
        resolver: &CategoryResolver,
        retention_floor: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> SyncResult<ItemSyncReport> {
        let mut report = ItemSyncReport {
            item_id: item.item_id.clone(),
            pages: 0,
            upserted: 0,
            removed: 0,
            skipped_before_floor: 0,
            cursor: String::new(),
        };
        let mut cursor = item.cursor.clone();

        loop {
            let page = self
                .provider
                .sync_transactions(&item.access_token, cursor.as_deref())
                .await
                .map_err(|source| SyncError::BankProvider {
                    item_id: item.item_id.clone(),
                    source,
                })?;
            report.pages += 1;

            let mut batch = Vec::with_capacity(page.added.len() + page.modified.len());
            for record in page.added.iter().chain(page.modified.iter()) {
                if retention_floor.is_some_and(|floor| record.date < floor) {
                    report.skipped_before_floor += 1;
                    continue;
                }
                batch.push(to_transaction(record, resolver, now));
            }

            if !batch.is_empty() {
                self.store.upsert_transactions(&batch).await?;
                report.upserted += batch.len();
            }
            if !page.removed.is_empty() {
                report.removed += self.store.delete_transactions(&page.removed).await?;
            }

            debug!(
                page = report.pages,
                added = page.added.len(),
                modified = page.modified.len(),
                removed = page.removed.len(),
                has_more = page.has_more,
                "applied change-stream page"
            );

            cursor = Some(page.next_cursor);
            if !page.has_more {
                break;
            }
        }

        let next_cursor = cursor.unwrap_or_default();
        let committed = self
            .store
            .commit_item_sync(&item.item_id, item.cursor.as_deref(), &next_cursor, now)
            .await?;
        if !committed {
            return Err(SyncError::CursorConflict {
                item_id: item.item_id.clone(),
            });
        }

        info!(
            pages = report.pages,
            upserted = report.upserted,
            removed = report.removed,
            "item sync committed"
        );
        report.cursor = next_cursor;
        Ok(report)
    }
}

pub fn to_transaction(record: &ProviderTransaction, resolver: &CategoryResolver, now: DateTime<Utc>) -> Transaction {
    Transaction {
        external_id: record.transaction_id.clone(),
        account_id: record.account_id.clone(),
        date: record.date,
        amount_cents: to_cents(record.amount),
        name: record.name.clone(),
        merchant_name: record.merchant_name.clone(),
        category_id: resolver.resolve(&record.name, record.merchant_name.as_deref(), record.primary_category()),
        pending: record.pending,
        updated_at: now,
    }
}
