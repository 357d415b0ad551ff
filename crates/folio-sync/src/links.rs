//! Linking and unlinking of bank items and brokerage connections, plus the
//! flag write behind the bank webhook.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use folio_core::{to_cents, BankAccount, BankHealth, BrokerageConnection, BrokerageHealth, BrokerageUser, Item};
use folio_providers::{BankProvider, BrokerageProvider, ProviderAccount};
use folio_storage::{FinanceStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Providers;
use crate::error::{SyncError, SyncResult};

/// Institution metadata reported by the link widget alongside the public token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub institution_id: String,
    pub name: String,
}

pub fn bank_account(item_id: &str, account: &ProviderAccount) -> BankAccount {
    BankAccount {
        account_id: account.account_id.clone(),
        item_id: item_id.to_string(),
        name: account.name.clone(),
        mask: account.mask.clone(),
        account_type: account.account_type.clone(),
        subtype: account.subtype.clone(),
        current_balance_cents: to_cents(account.balances.current.unwrap_or_default()),
    }
}

/// Sets the pending flag for a webhook notification. `false` means the item is unknown.
pub async fn mark_item_pending(store: &dyn FinanceStore, item_id: &str) -> StoreResult<bool> {
    let found = store.set_item_pending(item_id, true).await?;
    if found {
        info!(item_id, "item marked pending");
    } else {
        warn!(item_id, "webhook for unknown item ignored");
    }
    Ok(found)
}

pub struct LinkManager {
    store: Arc<dyn FinanceStore>,
    providers: Providers,
    owner_id: String,
}

impl LinkManager {
    pub fn new(store: Arc<dyn FinanceStore>, providers: Providers, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            providers,
            owner_id: owner_id.into(),
        }
    }

    fn bank(&self) -> SyncResult<&Arc<dyn BankProvider>> {
        self.providers.bank.as_ref().ok_or(SyncError::NotConfigured("bank"))
    }

    fn brokerage(&self) -> SyncResult<&Arc<dyn BrokerageProvider>> {
        self.providers.brokerage.as_ref().ok_or(SyncError::NotConfigured("brokerage"))
    }

    async fn item(&self, item_id: &str) -> SyncResult<Item> {
        self.store
            .get_item(item_id)
            .await?
            .ok_or_else(|| SyncError::UnknownItem(item_id.to_string()))
    }

    /// New link token, or an update-mode token for re-authenticating `update_item_id`.
    pub async fn create_link_token(&self, update_item_id: Option<&str>) -> SyncResult<String> {
        let bank = self.bank()?;
        let access_token = match update_item_id {
            Some(item_id) => Some(self.item(item_id).await?.access_token),
            None => None,
        };
        bank.create_link_token(&self.owner_id, access_token.as_deref())
            .await
            .map_err(SyncError::Link)
    }

    /// Stores a freshly linked item as pending so the next batch backfills it.
    /// A previous item for the same institution is replaced.
    pub async fn exchange_public_token(
        &self,
        public_token: &str,
        institution: Option<&Institution>,
        now: DateTime<Utc>,
    ) -> SyncResult<Item> {
        let bank = self.bank()?;
        let linked = bank.exchange_public_token(public_token).await.map_err(SyncError::Link)?;
        let accounts = bank
            .list_accounts(&linked.access_token)
            .await
            .map_err(|source| SyncError::BankProvider {
                item_id: linked.item_id.clone(),
                source,
            })?;

        if let Some(institution) = institution {
            for stale in self.store.list_items().await? {
                if stale.item_id != linked.item_id
                    && stale.institution_id.as_deref() == Some(institution.institution_id.as_str())
                {
                    info!(item_id = %stale.item_id, institution = %institution.name, "replacing previous link");
                    self.store.delete_item(&stale.item_id).await?;
                }
            }
        }

        let mut item = self
            .store
            .get_item(&linked.item_id)
            .await?
            .unwrap_or_else(|| Item::new(linked.item_id.clone(), linked.access_token.clone(), now));
        item.access_token = linked.access_token.clone();
        if let Some(institution) = institution {
            item.institution_id = Some(institution.institution_id.clone());
            item.institution_name = Some(institution.name.clone());
        }
        item.status = BankHealth::Ok;
        item.pending = true;
        item.last_updated = now;
        self.store.upsert_item(&item).await?;

        let rows = accounts
            .iter()
            .map(|account| bank_account(&item.item_id, account))
            .collect::<Vec<_>>();
        self.store.upsert_bank_accounts(&rows).await?;
        info!(item_id = %item.item_id, accounts = rows.len(), "item linked");
        Ok(item)
    }

    pub async fn remove_item(&self, item_id: &str) -> SyncResult<()> {
        let bank = self.bank()?;
        let item = self.item(item_id).await?;
        bank.remove_item(&item.access_token)
            .await
            .map_err(|source| SyncError::BankProvider {
                item_id: item_id.to_string(),
                source,
            })?;
        self.store.delete_item(item_id).await?;
        info!(item_id, "item removed");
        Ok(())
    }

    /// Stored brokerage user, registering one for the owner on first use.
    pub async fn ensure_brokerage_user(&self) -> SyncResult<BrokerageUser> {
        if let Some(user) = self.store.get_brokerage_user().await? {
            return Ok(user);
        }
        let user = self
            .brokerage()?
            .register_user(&self.owner_id)
            .await
            .map_err(SyncError::BrokerageProvider)?;
        self.store.save_brokerage_user(&user).await?;
        info!(user_id = %user.user_id, "brokerage user registered");
        Ok(user)
    }

    pub async fn connection_portal_url(&self) -> SyncResult<String> {
        let user = self.ensure_brokerage_user().await?;
        self.brokerage()?
            .connection_portal_url(&user)
            .await
            .map_err(SyncError::BrokerageProvider)
    }

    /// Mirrors the provider's connection list locally: listed connections are
    /// stored as `OK`, local ones the provider no longer lists are dropped.
    pub async fn refresh_connections(&self, now: DateTime<Utc>) -> SyncResult<Vec<BrokerageConnection>> {
        let brokerage = self.brokerage()?;
        let user = self.store.get_brokerage_user().await?.ok_or(SyncError::NoBrokerageUser)?;
        let listed = brokerage
            .list_connections(&user)
            .await
            .map_err(SyncError::BrokerageProvider)?;

        let mut connections = Vec::with_capacity(listed.len());
        for info in &listed {
            let connection = BrokerageConnection {
                connection_id: info.id.clone(),
                brokerage: info.brokerage_name.clone(),
                status: BrokerageHealth::Ok,
                last_checked: Some(now),
            };
            self.store.upsert_brokerage_connection(&connection).await?;
            connections.push(connection);
        }

        let keep: HashSet<&str> = listed.iter().map(|info| info.id.as_str()).collect();
        for local in self.store.list_brokerage_connections().await? {
            if !keep.contains(local.connection_id.as_str()) {
                self.store.delete_brokerage_connection(&local.connection_id).await?;
            }
        }
        Ok(connections)
    }

    pub async fn remove_connection(&self, connection_id: &str) -> SyncResult<()> {
        let brokerage = self.brokerage()?;
        let user = self.store.get_brokerage_user().await?.ok_or(SyncError::NoBrokerageUser)?;
        brokerage
            .remove_connection(&user, connection_id)
            .await
            .map_err(SyncError::BrokerageProvider)?;
        self.store.delete_brokerage_connection(connection_id).await?;
        info!(connection_id, "brokerage connection removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use folio_providers::{LinkedItem, ScriptedBankProvider, ScriptedBrokerageProvider};
    use folio_storage::MemoryStore;

    use super::*;

    fn fixture() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/bank/two-page-sync.json")
    }

    fn institution(id: &str) -> Institution {
        Institution {
            institution_id: id.to_string(),
            name: "First Platypus Bank".to_string(),
        }
    }

    fn manager(
        store: Arc<MemoryStore>,
        bank: Option<Arc<ScriptedBankProvider>>,
        brokerage: Option<Arc<ScriptedBrokerageProvider>>,
    ) -> LinkManager {
        let providers = Providers {
            bank: bank.map(|bank| bank as Arc<dyn BankProvider>),
            brokerage: brokerage.map(|brokerage| brokerage as Arc<dyn BrokerageProvider>),
        };
        LinkManager::new(store, providers, "owner")
    }

    #[tokio::test]
    async fn exchange_stores_pending_item_and_accounts() {
        let store = Arc::new(MemoryStore::new());
        let bank = Arc::new(ScriptedBankProvider::from_fixture(fixture()).expect("fixture"));
        let links = manager(store.clone(), Some(bank), None);

        let item = links
            .exchange_public_token("public-sandbox-checking", Some(&institution("ins_1")), Utc::now())
            .await
            .expect("exchange");

        assert_eq!(item.item_id, "item-checking");
        assert!(item.pending);
        assert_eq!(item.institution_id.as_deref(), Some("ins_1"));
        let accounts = store.list_bank_accounts(Some("item-checking")).await.expect("accounts");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].current_balance_cents, 152_042);
    }

    #[tokio::test]
    async fn relinking_an_institution_replaces_the_old_item() {
        let store = Arc::new(MemoryStore::new());
        let mut old = Item::new("item-old", "access-old", Utc::now());
        old.institution_id = Some("ins_1".to_string());
        store.upsert_item(&old).await.expect("seed");
        let bank = Arc::new(ScriptedBankProvider::from_fixture(fixture()).expect("fixture"));
        let links = manager(store.clone(), Some(bank), None);

        links
            .exchange_public_token("public-sandbox-checking", Some(&institution("ins_1")), Utc::now())
            .await
            .expect("exchange");

        assert!(store.get_item("item-old").await.expect("get").is_none());
        assert!(store.get_item("item-checking").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn relink_of_same_item_keeps_its_cursor() {
        let store = Arc::new(MemoryStore::new());
        let mut existing = Item::new("item-1", "access-stale", Utc::now());
        existing.cursor = Some("c9".to_string());
        existing.status = BankHealth::LoginRequired;
        store.upsert_item(&existing).await.expect("seed");
        let bank = Arc::new(ScriptedBankProvider::new());
        bank.add_exchange(
            "public-relink",
            LinkedItem {
                item_id: "item-1".into(),
                access_token: "access-fresh".into(),
            },
        );
        let links = manager(store.clone(), Some(bank), None);

        let item = links
            .exchange_public_token("public-relink", None, Utc::now())
            .await
            .expect("exchange");
        assert_eq!(item.cursor.as_deref(), Some("c9"));
        assert_eq!(item.access_token, "access-fresh");
        assert_eq!(item.status, BankHealth::Ok);
    }

    #[tokio::test]
    async fn update_mode_token_needs_a_known_item() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_item(&Item::new("item-1", "access-1", Utc::now()))
            .await
            .expect("seed");
        let links = manager(store, Some(Arc::new(ScriptedBankProvider::new())), None);

        assert_eq!(links.create_link_token(None).await.expect("new"), "link-new-owner");
        assert_eq!(
            links.create_link_token(Some("item-1")).await.expect("update"),
            "link-update-owner"
        );
        let err = links.create_link_token(Some("nope")).await.expect_err("unknown");
        assert!(matches!(err, SyncError::UnknownItem(id) if id == "nope"));
    }

    #[tokio::test]
    async fn remove_item_revokes_then_deletes() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_item(&Item::new("item-1", "access-1", Utc::now()))
            .await
            .expect("seed");
        let bank = Arc::new(ScriptedBankProvider::new());
        let links = manager(store.clone(), Some(bank.clone()), None);

        links.remove_item("item-1").await.expect("remove");
        assert_eq!(bank.removed_tokens(), vec!["access-1".to_string()]);
        assert!(store.get_item("item-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn webhook_flag_reports_unknown_items() {
        let store = MemoryStore::new();
        store
            .upsert_item(&Item::new("item-1", "access-1", Utc::now()))
            .await
            .expect("seed");
        assert!(mark_item_pending(&store, "item-1").await.expect("flag"));
        assert!(!mark_item_pending(&store, "item-2").await.expect("flag"));
        assert!(store.get_item("item-1").await.expect("get").expect("item").pending);
    }

    #[tokio::test]
    async fn brokerage_user_is_registered_once() {
        let store = Arc::new(MemoryStore::new());
        let brokerage = Arc::new(ScriptedBrokerageProvider::new());
        let links = manager(store.clone(), None, Some(brokerage.clone()));

        let first = links.ensure_brokerage_user().await.expect("user");
        let url = links.connection_portal_url().await.expect("portal");
        assert!(url.contains("owner"));
        assert_eq!(first.user_id, "owner");
        assert_eq!(brokerage.registered_users(), vec!["owner".to_string()]);
    }

    #[tokio::test]
    async fn refresh_mirrors_listed_connections() {
        let store = Arc::new(MemoryStore::new());
        let brokerage = Arc::new(ScriptedBrokerageProvider::new());
        let links = manager(store.clone(), None, Some(brokerage.clone()));
        links.ensure_brokerage_user().await.expect("user");
        brokerage.add_connection("conn-1", "Fidelity");
        store
            .upsert_brokerage_connection(&BrokerageConnection {
                connection_id: "conn-gone".into(),
                brokerage: "Schwab".into(),
                status: BrokerageHealth::ConnectionError,
                last_checked: None,
            })
            .await
            .expect("seed");

        let listed = links.refresh_connections(Utc::now()).await.expect("refresh");
        assert_eq!(listed.len(), 1);
        let stored = store.list_brokerage_connections().await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].connection_id, "conn-1");
        assert_eq!(stored[0].status, BrokerageHealth::Ok);

        links.remove_connection("conn-1").await.expect("remove");
        assert!(store.list_brokerage_connections().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn unconfigured_provider_is_reported() {
        let links = manager(Arc::new(MemoryStore::new()), None, None);
        let err = links.create_link_token(None).await.expect_err("no bank");
        assert!(matches!(err, SyncError::NotConfigured("bank")));
    }
}
