//! In-process providers that replay scripted responses. They back the sync
//! engine's tests and the `--fixture` mode of the CLI, so nothing here
//! touches the network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use folio_core::BrokerageUser;
use serde::Deserialize;

use crate::plaid::SyncResponse;
use crate::{
    read_json_file, BankProvider, BrokerageAccount, BrokerageProvider, ConnectionInfo, ItemStatus, LinkedItem, Position,
    ProviderAccount, ProviderError, SyncPage,
};

const PROVIDER: &str = "scripted";

fn scripted_error(code: &str) -> ProviderError {
    ProviderError::Api {
        provider: PROVIDER,
        code: code.to_string(),
        message: format!("scripted failure {code}"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted answer to a change-stream request.
#[derive(Debug)]
pub enum SyncStep {
    Page(SyncPage),
    Fail(ProviderError),
}

#[derive(Debug, Default)]
struct BankScript {
    sync_steps: HashMap<String, VecDeque<SyncStep>>,
    accounts: HashMap<String, Vec<ProviderAccount>>,
    status_failures: HashMap<String, String>,
    exchanges: HashMap<String, LinkedItem>,
    sync_cursors: HashMap<String, Vec<Option<String>>>,
    removed_tokens: Vec<String>,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedBankProvider {
    script: Mutex<BankScript>,
}

/// JSON layout of a bank fixture: per access token, the accounts and the
/// ordered change-stream pages (or `{"error_code": ...}` failures).
#[derive(Debug, Deserialize)]
pub struct BankFixture {
    #[serde(default)]
    pub exchanges: BTreeMap<String, LinkedItem>,
    pub items: BTreeMap<String, BankFixtureItem>,
}

#[derive(Debug, Deserialize)]
pub struct BankFixtureItem {
    #[serde(default)]
    pub accounts: Vec<ProviderAccount>,
    #[serde(default)]
    pub pages: Vec<FixtureStep>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FixtureStep {
    Failure { error_code: String },
    Page(SyncResponse),
}

impl ScriptedBankProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let fixture: BankFixture = read_json_file(path)?;
        let provider = Self::new();
        for (public_token, linked) in fixture.exchanges {
            provider.add_exchange(public_token, linked);
        }
        for (access_token, item) in fixture.items {
            provider.set_accounts(&access_token, item.accounts);
            for step in item.pages {
                match step {
                    FixtureStep::Failure { error_code } => provider.push_failure(&access_token, &error_code),
                    FixtureStep::Page(page) => provider.push_page(&access_token, page.into()),
                }
            }
        }
        Ok(provider)
    }

    pub fn push_page(&self, access_token: &str, page: SyncPage) {
        self.push_step(access_token, SyncStep::Page(page));
    }

    pub fn push_failure(&self, access_token: &str, code: &str) {
        self.push_step(access_token, SyncStep::Fail(scripted_error(code)));
    }

    pub fn push_step(&self, access_token: &str, step: SyncStep) {
        lock(&self.script)
            .sync_steps
            .entry(access_token.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn set_accounts(&self, access_token: &str, accounts: Vec<ProviderAccount>) {
        lock(&self.script).accounts.insert(access_token.to_string(), accounts);
    }

    /// Makes the item-status lookup fail with `code` until cleared.
    pub fn fail_item_status(&self, access_token: &str, code: &str) {
        lock(&self.script)
            .status_failures
            .insert(access_token.to_string(), code.to_string());
    }

    pub fn clear_item_status(&self, access_token: &str) {
        lock(&self.script).status_failures.remove(access_token);
    }

    pub fn add_exchange(&self, public_token: impl Into<String>, linked: LinkedItem) {
        lock(&self.script).exchanges.insert(public_token.into(), linked);
    }

    /// Cursors passed to `sync_transactions` for one token, in call order.
    pub fn sync_cursors(&self, access_token: &str) -> Vec<Option<String>> {
        lock(&self.script)
            .sync_cursors
            .get(access_token)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remaining_steps(&self, access_token: &str) -> usize {
        lock(&self.script)
            .sync_steps
            .get(access_token)
            .map_or(0, VecDeque::len)
    }

    pub fn removed_tokens(&self) -> Vec<String> {
        lock(&self.script).removed_tokens.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }
}

#[async_trait]
impl BankProvider for ScriptedBankProvider {
    async fn create_link_token(&self, owner_id: &str, access_token: Option<&str>) -> Result<String, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("create_link_token".to_string());
        Ok(match access_token {
            Some(_) => format!("link-update-{owner_id}"),
            None => format!("link-new-{owner_id}"),
        })
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<LinkedItem, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("exchange_public_token".to_string());
        script
            .exchanges
            .get(public_token)
            .cloned()
            .ok_or_else(|| scripted_error("INVALID_PUBLIC_TOKEN"))
    }

    async fn list_accounts(&self, access_token: &str) -> Result<Vec<ProviderAccount>, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("list_accounts".to_string());
        Ok(script.accounts.get(access_token).cloned().unwrap_or_default())
    }

    async fn sync_transactions(&self, access_token: &str, cursor: Option<&str>) -> Result<SyncPage, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("sync_transactions".to_string());
        script
            .sync_cursors
            .entry(access_token.to_string())
            .or_default()
            .push(cursor.map(str::to_string));

        let step = script.sync_steps.get_mut(access_token).and_then(VecDeque::pop_front);
        match step {
            Some(SyncStep::Page(page)) => Ok(page),
            Some(SyncStep::Fail(err)) => Err(err),
            // An exhausted script behaves like a stream with nothing new.
            None => Ok(SyncPage {
                next_cursor: cursor.unwrap_or_default().to_string(),
                ..SyncPage::default()
            }),
        }
    }

    async fn item_status(&self, access_token: &str) -> Result<ItemStatus, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("item_status".to_string());
        match script.status_failures.get(access_token) {
            Some(code) => Err(scripted_error(code)),
            None => Ok(ItemStatus {
                item_id: access_token.to_string(),
                institution_id: None,
            }),
        }
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("remove_item".to_string());
        script.removed_tokens.push(access_token.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerageScript {
    connections: Vec<ConnectionInfo>,
    accounts: Vec<BrokerageAccount>,
    positions: HashMap<String, Vec<Position>>,
    fail_connections: bool,
    fail_accounts: bool,
    fail_positions: HashSet<String>,
    registered: Vec<String>,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedBrokerageProvider {
    script: Mutex<BrokerageScript>,
}

impl ScriptedBrokerageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, id: &str, brokerage_name: &str) {
        lock(&self.script).connections.push(ConnectionInfo {
            id: id.to_string(),
            brokerage_name: brokerage_name.to_string(),
            brokerage_slug: brokerage_name.to_ascii_uppercase(),
        });
    }

    pub fn add_account(&self, account: BrokerageAccount, positions: Vec<Position>) {
        let mut script = lock(&self.script);
        script.positions.insert(account.id.clone(), positions);
        script.accounts.push(account);
    }

    pub fn set_fail_connections(&self, fail: bool) {
        lock(&self.script).fail_connections = fail;
    }

    pub fn set_fail_accounts(&self, fail: bool) {
        lock(&self.script).fail_accounts = fail;
    }

    pub fn set_fail_positions(&self, account_id: &str, fail: bool) {
        let mut script = lock(&self.script);
        if fail {
            script.fail_positions.insert(account_id.to_string());
        } else {
            script.fail_positions.remove(account_id);
        }
    }

    pub fn registered_users(&self) -> Vec<String> {
        lock(&self.script).registered.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }
}

#[async_trait]
impl BrokerageProvider for ScriptedBrokerageProvider {
    async fn register_user(&self, user_id: &str) -> Result<BrokerageUser, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("register_user".to_string());
        script.registered.push(user_id.to_string());
        Ok(BrokerageUser {
            user_id: user_id.to_string(),
            user_secret: format!("secret-{user_id}"),
        })
    }

    async fn connection_portal_url(&self, user: &BrokerageUser) -> Result<String, ProviderError> {
        lock(&self.script).calls.push("connection_portal_url".to_string());
        Ok(format!("https://portal.invalid/connect?user={}", user.user_id))
    }

    async fn list_connections(&self, _user: &BrokerageUser) -> Result<Vec<ConnectionInfo>, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("list_connections".to_string());
        if script.fail_connections {
            return Err(scripted_error("CONNECTIONS_UNAVAILABLE"));
        }
        Ok(script.connections.clone())
    }

    async fn list_accounts(&self, _user: &BrokerageUser) -> Result<Vec<BrokerageAccount>, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push("list_accounts".to_string());
        if script.fail_accounts {
            return Err(scripted_error("ACCOUNTS_UNAVAILABLE"));
        }
        Ok(script.accounts.clone())
    }

    async fn list_positions(&self, _user: &BrokerageUser, account_id: &str) -> Result<Vec<Position>, ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push(format!("list_positions:{account_id}"));
        if script.fail_positions.contains(account_id) {
            return Err(scripted_error("POSITIONS_UNAVAILABLE"));
        }
        Ok(script.positions.get(account_id).cloned().unwrap_or_default())
    }

    async fn remove_connection(&self, _user: &BrokerageUser, connection_id: &str) -> Result<(), ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push(format!("remove_connection:{connection_id}"));
        script.connections.retain(|connection| connection.id != connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn two_page_fixture() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/bank/two-page-sync.json")
    }

    #[tokio::test]
    async fn fixture_replays_pages_then_reports_no_changes() {
        let provider = ScriptedBankProvider::from_fixture(two_page_fixture()).expect("fixture");

        let first = provider
            .sync_transactions("access-sandbox-checking", None)
            .await
            .expect("page 1");
        assert_eq!(first.added.len(), 2);
        assert!(first.has_more);

        let second = provider
            .sync_transactions("access-sandbox-checking", Some("c1"))
            .await
            .expect("page 2");
        assert_eq!(second.removed.len(), 1);
        assert_eq!(second.next_cursor, "c2");
        assert!(!second.has_more);

        let idle = provider
            .sync_transactions("access-sandbox-checking", Some("c2"))
            .await
            .expect("idle");
        assert!(idle.added.is_empty());
        assert_eq!(idle.next_cursor, "c2");

        assert_eq!(
            provider.sync_cursors("access-sandbox-checking"),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
        let accounts = provider
            .list_accounts("access-sandbox-checking")
            .await
            .expect("accounts");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balances.current, Some(1520.42));
    }

    #[tokio::test]
    async fn failures_are_returned_in_script_order() {
        let provider = ScriptedBankProvider::new();
        provider.push_failure("token", "INSTITUTION_DOWN");
        let err = provider
            .sync_transactions("token", None)
            .await
            .expect_err("scripted failure");
        assert_eq!(err.failure_code(), "INSTITUTION_DOWN");
        assert_eq!(provider.remaining_steps("token"), 0);
    }

    #[tokio::test]
    async fn brokerage_failures_toggle_per_call() {
        let provider = ScriptedBrokerageProvider::new();
        let user = provider.register_user("owner").await.expect("register");
        provider.add_connection("conn-1", "Fidelity");
        provider.set_fail_accounts(true);

        assert_eq!(provider.list_connections(&user).await.expect("connections").len(), 1);
        assert!(provider.list_accounts(&user).await.is_err());

        provider.set_fail_accounts(false);
        assert!(provider.list_accounts(&user).await.expect("accounts").is_empty());

        provider.remove_connection(&user, "conn-1").await.expect("remove");
        assert!(provider.list_connections(&user).await.expect("connections").is_empty());
    }
}
