//! Applies provider outcomes to persisted connection health.
//!
//! Only called on error paths and for connections already flagged unhealthy;
//! healthy connections are never probed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use folio_core::health::{BankOutcome, BrokerageProbe};
use folio_core::{BankHealth, BrokerageConnection, BrokerageHealth, BrokerageUser, Item};
use folio_providers::{BankProvider, BrokerageProvider, ProviderError};
use folio_storage::{FinanceStore, StoreResult};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerageCheck {
    pub probe: &'static str,
    pub connections_updated: usize,
    pub unhealthy: usize,
}

pub struct HealthMonitor {
    store: Arc<dyn FinanceStore>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }

    /// Classifies a failed bank call and persists the resulting status when it changed.
    pub async fn record_bank_failure(
        &self,
        item: &Item,
        error: &ProviderError,
        now: DateTime<Utc>,
    ) -> StoreResult<BankHealth> {
        let code = error.failure_code();
        let next = item.status.next(BankOutcome::Failure { code: &code });
        if next != item.status {
            warn!(item_id = %item.item_id, code = %code, status = next.as_str(), "bank item needs reconnection");
            self.store.set_item_status(&item.item_id, next, now).await?;
        } else {
            warn!(item_id = %item.item_id, code = %code, "transient bank failure; status unchanged");
        }
        Ok(next)
    }

    pub async fn record_bank_success(&self, item: &Item, now: DateTime<Utc>) -> StoreResult<BankHealth> {
        let next = item.status.next(BankOutcome::Success);
        if next != item.status {
            info!(item_id = %item.item_id, "bank item recovered");
            self.store.set_item_status(&item.item_id, next, now).await?;
        }
        Ok(next)
    }

    /// Status lookup for an item already flagged unhealthy.
    pub async fn recheck_bank_item(
        &self,
        provider: &dyn BankProvider,
        item: &Item,
        now: DateTime<Utc>,
    ) -> StoreResult<Result<BankHealth, BankHealth>> {
        match provider.item_status(&item.access_token).await {
            Ok(_) => self.record_bank_success(item, now).await.map(Ok),
            Err(err) => self.record_bank_failure(item, &err, now).await.map(Err),
        }
    }

    /// Runs the two sequential brokerage probes and applies the two-strike
    /// rule. Connections that fail the listing escalate from their stored
    /// status; a full success resets every listed connection to `OK`.
    pub async fn check_brokerage(
        &self,
        provider: &dyn BrokerageProvider,
        user: &BrokerageUser,
        now: DateTime<Utc>,
    ) -> StoreResult<BrokerageCheck> {
        let stored = self.store.list_brokerage_connections().await?;

        let (probe, targets) = match provider.list_connections(user).await {
            Err(err) => {
                warn!(error = %err, "brokerage connection listing failed");
                (BrokerageProbe::ConnectionsFailed, stored)
            }
            Ok(listed) => {
                let known: HashMap<&str, BrokerageHealth> = stored
                    .iter()
                    .map(|connection| (connection.connection_id.as_str(), connection.status))
                    .collect();
                let targets = listed
                    .iter()
                    .map(|info| BrokerageConnection {
                        connection_id: info.id.clone(),
                        brokerage: info.brokerage_name.clone(),
                        status: known.get(info.id.as_str()).copied().unwrap_or_default(),
                        last_checked: None,
                    })
                    .collect::<Vec<_>>();
                match provider.list_accounts(user).await {
                    Err(err) => {
                        warn!(error = %err, "brokerage account listing failed");
                        (BrokerageProbe::AccountsFailed, targets)
                    }
                    Ok(_) => (BrokerageProbe::Healthy, targets),
                }
            }
        };

        let mut unhealthy = 0;
        for mut connection in targets.iter().cloned() {
            connection.status = connection.status.next(probe);
            connection.last_checked = Some(now);
            if connection.status != BrokerageHealth::Ok {
                unhealthy += 1;
            }
            self.store.upsert_brokerage_connection(&connection).await?;
        }

        let probe_label = match probe {
            BrokerageProbe::Healthy => "healthy",
            BrokerageProbe::ConnectionsFailed => "connections_failed",
            BrokerageProbe::AccountsFailed => "accounts_failed",
        };
        info!(probe = probe_label, connections = targets.len(), unhealthy, "brokerage health checked");
        Ok(BrokerageCheck {
            probe: probe_label,
            connections_updated: targets.len(),
            unhealthy,
        })
    }
}

#[cfg(test)]
mod tests {
    use folio_providers::{ScriptedBankProvider, ScriptedBrokerageProvider};
    use folio_storage::{FetchError, MemoryStore};

    use super::*;

    fn api(code: &str) -> ProviderError {
        ProviderError::Api {
            provider: "plaid",
            code: code.to_string(),
            message: String::new(),
        }
    }

    async fn store_with_item() -> (Arc<MemoryStore>, Item) {
        let store = Arc::new(MemoryStore::new());
        let item = Item::new("item-1", "access-1", Utc::now());
        store.upsert_item(&item).await.expect("seed");
        (store, item)
    }

    #[tokio::test]
    async fn reauth_and_unknown_codes_fail_closed() {
        let (store, item) = store_with_item().await;
        let monitor = HealthMonitor::new(store.clone());

        let next = monitor
            .record_bank_failure(&item, &api("SOMETHING_NEW"), Utc::now())
            .await
            .expect("record");
        assert_eq!(next, BankHealth::LoginRequired);
        let stored = store.get_item("item-1").await.expect("get").expect("item");
        assert_eq!(stored.status, BankHealth::LoginRequired);
    }

    #[tokio::test]
    async fn transient_failures_leave_status_alone() {
        let (store, item) = store_with_item().await;
        let monitor = HealthMonitor::new(store.clone());
        let timeout = ProviderError::Fetch(FetchError::Timeout { url: "u".into() });

        for err in [api("INSTITUTION_DOWN"), api("RATE_LIMIT_EXCEEDED"), timeout] {
            let next = monitor.record_bank_failure(&item, &err, Utc::now()).await.expect("record");
            assert_eq!(next, BankHealth::Ok);
        }
        let stored = store.get_item("item-1").await.expect("get").expect("item");
        assert_eq!(stored.status, BankHealth::Ok);
    }

    #[tokio::test]
    async fn recheck_recovers_item_once_lookup_succeeds() {
        let (store, mut item) = store_with_item().await;
        item.status = BankHealth::LoginRequired;
        store.upsert_item(&item).await.expect("flag");
        let monitor = HealthMonitor::new(store.clone());
        let provider = ScriptedBankProvider::new();

        provider.fail_item_status("access-1", "ITEM_LOGIN_REQUIRED");
        let still_broken = monitor.recheck_bank_item(&provider, &item, Utc::now()).await.expect("recheck");
        assert_eq!(still_broken, Err(BankHealth::LoginRequired));

        provider.clear_item_status("access-1");
        let recovered = monitor.recheck_bank_item(&provider, &item, Utc::now()).await.expect("recheck");
        assert_eq!(recovered, Ok(BankHealth::Ok));
        let stored = store.get_item("item-1").await.expect("get").expect("item");
        assert_eq!(stored.status, BankHealth::Ok);
    }

    async fn brokerage_fixture() -> (Arc<MemoryStore>, ScriptedBrokerageProvider, BrokerageUser) {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedBrokerageProvider::new();
        let user = provider.register_user("owner").await.expect("register");
        provider.add_connection("conn-1", "Fidelity");
        store
            .upsert_brokerage_connection(&BrokerageConnection {
                connection_id: "conn-1".into(),
                brokerage: "Fidelity".into(),
                status: BrokerageHealth::Ok,
                last_checked: None,
            })
            .await
            .expect("seed");
        (store, provider, user)
    }

    async fn status_of(store: &MemoryStore) -> BrokerageHealth {
        store.list_brokerage_connections().await.expect("list")[0].status
    }

    #[tokio::test]
    async fn three_account_failures_escalate_then_saturate() {
        let (store, provider, user) = brokerage_fixture().await;
        let monitor = HealthMonitor::new(store.clone());
        provider.set_fail_accounts(true);

        let mut seen = Vec::new();
        for _ in 0..3 {
            monitor.check_brokerage(&provider, &user, Utc::now()).await.expect("check");
            seen.push(status_of(&store).await);
        }
        assert_eq!(
            seen,
            vec![
                BrokerageHealth::AccountFetchError,
                BrokerageHealth::ConnectionError,
                BrokerageHealth::ConnectionError
            ]
        );

        provider.set_fail_accounts(false);
        let check = monitor.check_brokerage(&provider, &user, Utc::now()).await.expect("check");
        assert_eq!(check.probe, "healthy");
        assert_eq!(status_of(&store).await, BrokerageHealth::Ok);
    }

    #[tokio::test]
    async fn connection_listing_failure_escalates_stored_connections() {
        let (store, provider, user) = brokerage_fixture().await;
        let monitor = HealthMonitor::new(store.clone());
        provider.set_fail_connections(true);

        let check = monitor.check_brokerage(&provider, &user, Utc::now()).await.expect("check");
        assert_eq!(check.probe, "connections_failed");
        assert_eq!(check.unhealthy, 1);
        assert_eq!(status_of(&store).await, BrokerageHealth::AccountFetchError);
        let calls = provider.calls();
        assert!(!calls.iter().any(|call| call == "list_accounts"));
    }
}
