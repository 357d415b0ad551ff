//! Capability contracts for the two external aggregators plus their HTTP
//! clients and scripted stand-ins.
//!
//! The sync engine only sees [`BankProvider`] and [`BrokerageProvider`];
//! wire shapes stay inside the client modules.

use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use folio_core::BrokerageUser;
use folio_storage::FetchError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod plaid;
pub mod scripted;
pub mod snaptrade;

pub use plaid::{PlaidClient, PlaidConfig};
pub use scripted::{BankFixture, ScriptedBankProvider, ScriptedBrokerageProvider, SyncStep};
pub use snaptrade::{SnapTradeClient, SnapTradeConfig};

pub const CRATE_NAME: &str = "folio-providers";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error {code}: {message}")]
    Api {
        provider: &'static str,
        code: String,
        message: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable {provider} response: {message}")]
    Decode { provider: &'static str, message: String },
    #[error("{provider} response missing {field}")]
    MissingField { provider: &'static str, field: &'static str },
    #[error("{0}")]
    Config(String),
}

impl ProviderError {
    /// Error code fed to the bank health classifier.
    pub fn failure_code(&self) -> String {
        match self {
            ProviderError::Api { code, .. } => code.clone(),
            ProviderError::Fetch(FetchError::Timeout { .. }) => "TIMEOUT".to_string(),
            ProviderError::Fetch(FetchError::Connect { .. } | FetchError::Transport { .. }) => {
                "NETWORK_ERROR".to_string()
            }
            ProviderError::Fetch(FetchError::HttpStatus { status: 429, .. }) => "RATE_LIMIT_EXCEEDED".to_string(),
            ProviderError::Fetch(FetchError::HttpStatus { status, .. }) => format!("HTTP_{status}"),
            ProviderError::Decode { .. } | ProviderError::MissingField { .. } => "UNRECOGNIZED_RESPONSE".to_string(),
            ProviderError::Config(_) => "CONFIGURATION_ERROR".to_string(),
        }
    }
}

/// Credential pair returned by a successful public-token exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedItem {
    pub item_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for LinkedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedItem")
            .field("item_id", &self.item_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub balances: AccountBalances,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalances {
    #[serde(default)]
    pub current: Option<f64>,
}

/// Transaction as delivered by the bank change stream. `amount` keeps the
/// provider sign: positive is money leaving the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: f64,
    pub date: NaiveDate,
    pub name: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub pending: bool,
}

impl ProviderTransaction {
    /// First element of the provider's category hierarchy.
    pub fn primary_category(&self) -> Option<&str> {
        self.category
            .as_ref()
            .and_then(|levels| levels.first())
            .map(String::as_str)
            .filter(|primary| !primary.is_empty())
    }
}

/// One page of the incremental change stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPage {
    pub added: Vec<ProviderTransaction>,
    pub modified: Vec<ProviderTransaction>,
    pub removed: Vec<String>,
    pub next_cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStatus {
    pub item_id: String,
    pub institution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub brokerage_name: String,
    pub brokerage_slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerageAccount {
    pub id: String,
    pub name: String,
    pub number: String,
    pub institution_name: String,
    pub balance: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub value_cents: i64,
}

#[async_trait]
pub trait BankProvider: Send + Sync {
    /// Link token for a new item, or for update mode when `access_token` is given.
    async fn create_link_token(&self, owner_id: &str, access_token: Option<&str>) -> Result<String, ProviderError>;
    async fn exchange_public_token(&self, public_token: &str) -> Result<LinkedItem, ProviderError>;
    async fn list_accounts(&self, access_token: &str) -> Result<Vec<ProviderAccount>, ProviderError>;
    /// `None` starts the change stream from the beginning.
    async fn sync_transactions(&self, access_token: &str, cursor: Option<&str>) -> Result<SyncPage, ProviderError>;
    /// Fails with the item's current error code when the item is unhealthy.
    async fn item_status(&self, access_token: &str) -> Result<ItemStatus, ProviderError>;
    async fn remove_item(&self, access_token: &str) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait BrokerageProvider: Send + Sync {
    async fn register_user(&self, user_id: &str) -> Result<BrokerageUser, ProviderError>;
    async fn connection_portal_url(&self, user: &BrokerageUser) -> Result<String, ProviderError>;
    async fn list_connections(&self, user: &BrokerageUser) -> Result<Vec<ConnectionInfo>, ProviderError>;
    async fn list_accounts(&self, user: &BrokerageUser) -> Result<Vec<BrokerageAccount>, ProviderError>;
    async fn list_positions(&self, user: &BrokerageUser, account_id: &str) -> Result<Vec<Position>, ProviderError>;
    async fn remove_connection(&self, user: &BrokerageUser, connection_id: &str) -> Result<(), ProviderError>;
}

pub(crate) fn decode_json<T: DeserializeOwned>(provider: &'static str, body: &[u8]) -> Result<T, ProviderError> {
    serde_json::from_slice(body).map_err(|err| ProviderError::Decode {
        provider,
        message: err.to_string(),
    })
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: &str) -> ProviderError {
        ProviderError::Api {
            provider: "plaid",
            code: code.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn failure_codes_cover_transport_and_api_errors() {
        assert_eq!(api("ITEM_LOGIN_REQUIRED").failure_code(), "ITEM_LOGIN_REQUIRED");
        assert_eq!(
            ProviderError::Fetch(FetchError::Timeout { url: "u".into() }).failure_code(),
            "TIMEOUT"
        );
        assert_eq!(
            ProviderError::Fetch(FetchError::Connect {
                url: "u".into(),
                message: "refused".into()
            })
            .failure_code(),
            "NETWORK_ERROR"
        );
        assert_eq!(
            ProviderError::Fetch(FetchError::HttpStatus {
                status: 429,
                url: "u".into(),
                body: vec![]
            })
            .failure_code(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            ProviderError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: "u".into(),
                body: vec![]
            })
            .failure_code(),
            "HTTP_503"
        );
        assert_eq!(
            ProviderError::Decode {
                provider: "plaid",
                message: "eof".into()
            }
            .failure_code(),
            "UNRECOGNIZED_RESPONSE"
        );
    }

    #[test]
    fn primary_category_is_first_non_empty_level() {
        let mut txn: ProviderTransaction = serde_json::from_value(serde_json::json!({
            "transaction_id": "t1",
            "account_id": "a1",
            "amount": 12.5,
            "date": "2026-03-14",
            "name": "Uber 063015 SF**POOL**",
            "category": ["Travel", "Taxi"]
        }))
        .expect("decode");
        assert_eq!(txn.primary_category(), Some("Travel"));
        assert!(!txn.pending);
        txn.category = Some(vec![]);
        assert_eq!(txn.primary_category(), None);
        txn.category = None;
        assert_eq!(txn.primary_category(), None);
    }

    #[test]
    fn linked_item_debug_redacts_token() {
        let linked = LinkedItem {
            item_id: "item".into(),
            access_token: "access-sandbox-123".into(),
        };
        assert!(!format!("{linked:?}").contains("access-sandbox-123"));
    }
}
