//! Bank aggregator client speaking the Plaid JSON API.

use std::sync::Arc;

use async_trait::async_trait;
use folio_storage::{FetchError, HttpFetcher, RequestSpec};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{decode_json, BankProvider, ItemStatus, LinkedItem, ProviderAccount, ProviderError, ProviderTransaction, SyncPage};

const PROVIDER: &str = "plaid";

#[derive(Clone)]
pub struct PlaidConfig {
    pub client_id: String,
    pub secret: String,
    /// `sandbox`, `development` or `production`.
    pub environment: String,
    pub webhook_url: Option<String>,
    pub client_name: String,
}

impl std::fmt::Debug for PlaidConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaidConfig")
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .field("environment", &self.environment)
            .field("webhook_url", &self.webhook_url)
            .field("client_name", &self.client_name)
            .finish()
    }
}

pub fn base_url_for_environment(environment: &str) -> Result<String, ProviderError> {
    match environment {
        "sandbox" | "development" | "production" => Ok(format!("https://{environment}.plaid.com")),
        other => Err(ProviderError::Config(format!("unknown PLAID_ENV `{other}`"))),
    }
}

#[derive(Debug)]
pub struct PlaidClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    config: PlaidConfig,
}

impl PlaidClient {
    pub fn new(config: PlaidConfig, http: Arc<HttpFetcher>) -> Result<Self, ProviderError> {
        let base_url = base_url_for_environment(&config.environment)?;
        Ok(Self::with_base_url(config, http, base_url))
    }

    pub fn with_base_url(config: PlaidConfig, http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
        }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, mut body: Value) -> Result<T, ProviderError> {
        if let Value::Object(fields) = &mut body {
            fields.insert("client_id".to_string(), Value::String(self.config.client_id.clone()));
            fields.insert("secret".to_string(), Value::String(self.config.secret.clone()));
        }
        let spec = RequestSpec::post_json(format!("{}{path}", self.base_url), body);
        match self.http.send(PROVIDER, &spec).await {
            Ok(response) => decode_json(PROVIDER, &response.body),
            Err(err) => Err(map_fetch_error(err)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

/// Prefers the structured error body; falls back to the transport error so
/// the status-derived code applies.
fn map_fetch_error(err: FetchError) -> ProviderError {
    if let FetchError::HttpStatus { body, .. } = &err {
        if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
            if !parsed.error_code.is_empty() {
                debug!(error_type = %parsed.error_type, error_code = %parsed.error_code, "plaid error body");
                return ProviderError::Api {
                    provider: PROVIDER,
                    code: parsed.error_code,
                    message: parsed.error_message,
                };
            }
        }
    }
    ProviderError::Fetch(err)
}

#[derive(Debug, Deserialize)]
struct LinkTokenResponse {
    link_token: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<ProviderAccount>,
}

#[derive(Debug, Deserialize)]
struct RemovedTransaction {
    transaction_id: String,
}

/// Wire shape of one `/transactions/sync` page.
#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    added: Vec<ProviderTransaction>,
    #[serde(default)]
    modified: Vec<ProviderTransaction>,
    #[serde(default)]
    removed: Vec<RemovedTransaction>,
    next_cursor: String,
    #[serde(default)]
    has_more: bool,
}

impl From<SyncResponse> for SyncPage {
    fn from(response: SyncResponse) -> Self {
        SyncPage {
            added: response.added,
            modified: response.modified,
            removed: response.removed.into_iter().map(|removed| removed.transaction_id).collect(),
            next_cursor: response.next_cursor,
            has_more: response.has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    item: ItemBody,
}

#[derive(Debug, Deserialize)]
struct ItemBody {
    item_id: String,
    #[serde(default)]
    institution_id: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

impl ItemResponse {
    fn into_status(self) -> Result<ItemStatus, ProviderError> {
        match self.item.error {
            Some(error) if !error.error_code.is_empty() => Err(ProviderError::Api {
                provider: PROVIDER,
                code: error.error_code,
                message: error.error_message,
            }),
            _ => Ok(ItemStatus {
                item_id: self.item.item_id,
                institution_id: self.item.institution_id,
            }),
        }
    }
}

#[async_trait]
impl BankProvider for PlaidClient {
    async fn create_link_token(&self, owner_id: &str, access_token: Option<&str>) -> Result<String, ProviderError> {
        let mut body = json!({
            "client_name": self.config.client_name,
            "user": { "client_user_id": owner_id },
            "country_codes": ["US"],
            "language": "en",
        });
        if let Some(webhook) = &self.config.webhook_url {
            body["webhook"] = Value::String(webhook.clone());
        }
        // Update mode relinks an existing item and must not request products.
        match access_token {
            Some(token) => body["access_token"] = Value::String(token.to_string()),
            None => body["products"] = json!(["transactions"]),
        }

        let response: LinkTokenResponse = self.post("/link/token/create", body).await?;
        if response.link_token.is_empty() {
            return Err(ProviderError::MissingField {
                provider: PROVIDER,
                field: "link_token",
            });
        }
        Ok(response.link_token)
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<LinkedItem, ProviderError> {
        let response: ExchangeResponse = self
            .post("/item/public_token/exchange", json!({ "public_token": public_token }))
            .await?;
        Ok(LinkedItem {
            item_id: response.item_id,
            access_token: response.access_token,
        })
    }

    async fn list_accounts(&self, access_token: &str) -> Result<Vec<ProviderAccount>, ProviderError> {
        let response: AccountsResponse = self.post("/accounts/get", json!({ "access_token": access_token })).await?;
        Ok(response.accounts)
    }

    async fn sync_transactions(&self, access_token: &str, cursor: Option<&str>) -> Result<SyncPage, ProviderError> {
        let mut body = json!({ "access_token": access_token });
        if let Some(cursor) = cursor.filter(|cursor| !cursor.is_empty()) {
            body["cursor"] = Value::String(cursor.to_string());
        }
        let response: SyncResponse = self.post("/transactions/sync", body).await?;
        Ok(response.into())
    }

    async fn item_status(&self, access_token: &str) -> Result<ItemStatus, ProviderError> {
        let response: ItemResponse = self.post("/item/get", json!({ "access_token": access_token })).await?;
        response.into_status()
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), ProviderError> {
        let _: Value = self.post("/item/remove", json!({ "access_token": access_token })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::NaiveDate;

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join("bank")
            .join(name)
    }

    #[test]
    fn environments_map_to_hosts() {
        assert_eq!(
            base_url_for_environment("sandbox").expect("sandbox"),
            "https://sandbox.plaid.com"
        );
        assert!(base_url_for_environment("staging").is_err());
    }

    #[test]
    fn sync_response_fixture_decodes_into_page() {
        let bytes = std::fs::read(fixture("sync-response.json")).expect("read fixture");
        let response: SyncResponse = decode_json(PROVIDER, &bytes).expect("decode");
        let page = SyncPage::from(response);

        assert_eq!(page.added.len(), 2);
        assert_eq!(page.modified.len(), 1);
        assert_eq!(page.removed, vec!["txn-removed-1".to_string()]);
        assert_eq!(page.next_cursor, "cursor-after-page-1");
        assert!(page.has_more);
        assert_eq!(
            page.added[0].date,
            NaiveDate::from_ymd_opt(2026, 3, 2).expect("date")
        );
        assert_eq!(page.added[0].primary_category(), Some("Food and Drink"));
        assert_eq!(page.added[1].merchant_name.as_deref(), Some("Vanguard"));
    }

    #[test]
    fn error_body_becomes_api_error() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 400,
            url: "https://sandbox.plaid.com/transactions/sync".into(),
            body: br#"{"error_type":"ITEM_ERROR","error_code":"ITEM_LOGIN_REQUIRED","error_message":"login required"}"#
                .to_vec(),
        });
        assert_eq!(err.failure_code(), "ITEM_LOGIN_REQUIRED");
    }

    #[test]
    fn bodyless_status_falls_back_to_http_code() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 502,
            url: "https://sandbox.plaid.com/transactions/sync".into(),
            body: b"<html>bad gateway</html>".to_vec(),
        });
        assert_eq!(err.failure_code(), "HTTP_502");
    }

    #[test]
    fn item_error_surfaces_as_failure() {
        let healthy: ItemResponse =
            serde_json::from_value(json!({"item": {"item_id": "item-1", "institution_id": "ins_3", "error": null}}))
                .expect("decode");
        assert_eq!(
            healthy.into_status().expect("healthy"),
            ItemStatus {
                item_id: "item-1".into(),
                institution_id: Some("ins_3".into())
            }
        );

        let broken: ItemResponse = serde_json::from_value(json!({
            "item": {
                "item_id": "item-1",
                "error": {"error_type": "ITEM_ERROR", "error_code": "ITEM_LOGIN_REQUIRED", "error_message": "relink"}
            }
        }))
        .expect("decode");
        let err = broken.into_status().expect_err("item error");
        assert_eq!(err.failure_code(), "ITEM_LOGIN_REQUIRED");
    }
}
