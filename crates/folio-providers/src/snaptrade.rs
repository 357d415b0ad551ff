//! Brokerage aggregator client for the SnapTrade REST API.
//!
//! Every request carries `clientId`, `timestamp` and (for user-scoped calls)
//! `userId`/`userSecret` as query parameters, plus a `Signature` header: the
//! base64 HMAC-SHA256 of a canonical JSON document over the body, path and
//! query string, keyed by the consumer key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use folio_core::{to_cents, BrokerageUser};
use folio_storage::{FetchError, HttpFetcher, RequestSpec};
use hmac::{Hmac, Mac};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{decode_json, BrokerageAccount, BrokerageProvider, ConnectionInfo, Position, ProviderError};

type HmacSha256 = Hmac<Sha256>;

const PROVIDER: &str = "snaptrade";
const API_PREFIX: &str = "/api/v1";
pub const DEFAULT_BASE_URL: &str = "https://api.snaptrade.com";

#[derive(Clone)]
pub struct SnapTradeConfig {
    pub client_id: String,
    pub consumer_key: String,
    pub base_url: String,
}

impl std::fmt::Debug for SnapTradeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapTradeConfig")
            .field("client_id", &self.client_id)
            .field("consumer_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Canonical document the signature covers. `serde_json` maps keep keys
/// sorted, which is the ordering the API verifies against.
pub fn signature_payload(path: &str, query: &str, content: Option<&Value>) -> Result<String, ProviderError> {
    let document = json!({
        "content": content,
        "path": path,
        "query": query,
    });
    serde_json::to_string(&document).map_err(|err| ProviderError::Config(format!("encoding signature payload: {err}")))
}

pub fn sign(consumer_key: &str, payload: &str) -> Result<String, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(consumer_key.as_bytes())
        .map_err(|err| ProviderError::Config(format!("invalid consumer key: {err}")))?;
    mac.update(payload.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[derive(Debug)]
pub struct SnapTradeClient {
    http: Arc<HttpFetcher>,
    config: SnapTradeConfig,
}

impl SnapTradeClient {
    pub fn new(mut config: SnapTradeConfig, http: Arc<HttpFetcher>) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self { http, config }
    }

    fn signed_request(
        &self,
        method: Method,
        endpoint: &str,
        user: Option<&BrokerageUser>,
        body: Option<Value>,
    ) -> Result<RequestSpec, ProviderError> {
        let path = format!("{API_PREFIX}{endpoint}");
        let timestamp = Utc::now().timestamp().to_string();
        let mut params = vec![("clientId", self.config.client_id.as_str()), ("timestamp", timestamp.as_str())];
        if let Some(user) = user {
            params.push(("userId", user.user_id.as_str()));
            params.push(("userSecret", user.user_secret.as_str()));
        }
        let url = Url::parse_with_params(&format!("{}{path}", self.config.base_url), &params)
            .map_err(|err| ProviderError::Config(format!("invalid SnapTrade url: {err}")))?;

        let payload = signature_payload(&path, url.query().unwrap_or_default(), body.as_ref())?;
        let signature = sign(&self.config.consumer_key, &payload)?;

        let mut spec = RequestSpec::new(method, url.to_string()).header("Signature", signature);
        if let Some(body) = body {
            spec = spec.json(body);
        }
        Ok(spec)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        user: Option<&BrokerageUser>,
        body: Option<Value>,
    ) -> Result<T, ProviderError> {
        let spec = self.signed_request(method, endpoint, user, body)?;
        match self.http.send(PROVIDER, &spec).await {
            Ok(response) if response.body.is_empty() => decode_json(PROVIDER, b"null"),
            Ok(response) => decode_json(PROVIDER, &response.body),
            Err(err) => Err(map_fetch_error(err)),
        }
    }
}

fn map_fetch_error(err: FetchError) -> ProviderError {
    if let FetchError::HttpStatus { body, .. } = &err {
        if let Ok(parsed) = serde_json::from_slice::<Value>(body) {
            let code = match parsed.get("code") {
                Some(Value::String(code)) => Some(code.clone()),
                Some(Value::Number(code)) => Some(code.to_string()),
                _ => None,
            };
            if let Some(code) = code {
                let message = parsed
                    .get("detail")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return ProviderError::Api {
                    provider: PROVIDER,
                    code,
                    message,
                };
            }
        }
    }
    ProviderError::Fetch(err)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    user_id: String,
    user_secret: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "redirectURI", default)]
    redirect_uri: String,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    id: String,
    #[serde(default)]
    brokerage: AuthorizationBrokerage,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorizationBrokerage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AccountBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    institution_name: Option<String>,
    #[serde(default)]
    balance: Option<BalanceBody>,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    #[serde(default)]
    total: Option<AmountBody>,
}

#[derive(Debug, Deserialize)]
struct AmountBody {
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
}

impl From<AccountBody> for BrokerageAccount {
    fn from(body: AccountBody) -> Self {
        let total = body.balance.and_then(|balance| balance.total);
        let (balance, currency) = match total {
            Some(total) => (total.amount.unwrap_or(0.0), total.currency.unwrap_or_default()),
            None => (0.0, String::new()),
        };
        BrokerageAccount {
            id: body.id,
            name: body.name.unwrap_or_default(),
            number: body.number.unwrap_or_default(),
            institution_name: body.institution_name.unwrap_or_default(),
            balance,
            currency,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PositionBody {
    #[serde(default)]
    symbol: Option<PositionSymbol>,
    #[serde(default)]
    units: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PositionSymbol {
    #[serde(default)]
    symbol: Option<UniversalSymbol>,
}

#[derive(Debug, Deserialize)]
struct UniversalSymbol {
    #[serde(default)]
    symbol: Option<String>,
}

impl PositionBody {
    /// Positions without a ticker cannot be keyed and are dropped.
    fn into_position(self) -> Option<Position> {
        let symbol = self.symbol?.symbol?.symbol.filter(|symbol| !symbol.is_empty())?;
        let quantity = self.units.unwrap_or(0.0);
        let price = self.price.unwrap_or(0.0);
        let value_cents = if quantity > 0.0 && price > 0.0 {
            to_cents(quantity * price)
        } else {
            0
        };
        Some(Position {
            symbol,
            quantity,
            value_cents,
        })
    }
}

#[async_trait]
impl BrokerageProvider for SnapTradeClient {
    async fn register_user(&self, user_id: &str) -> Result<BrokerageUser, ProviderError> {
        let response: RegisterResponse = self
            .call(Method::POST, "/snapTrade/registerUser", None, Some(json!({ "userId": user_id })))
            .await?;
        Ok(BrokerageUser {
            user_id: response.user_id,
            user_secret: response.user_secret,
        })
    }

    async fn connection_portal_url(&self, user: &BrokerageUser) -> Result<String, ProviderError> {
        let response: LoginResponse = self
            .call(
                Method::POST,
                "/snapTrade/login",
                Some(user),
                Some(json!({ "connectionType": "read" })),
            )
            .await?;
        if response.redirect_uri.is_empty() {
            return Err(ProviderError::MissingField {
                provider: PROVIDER,
                field: "redirectURI",
            });
        }
        Ok(response.redirect_uri)
    }

    async fn list_connections(&self, user: &BrokerageUser) -> Result<Vec<ConnectionInfo>, ProviderError> {
        let authorizations: Vec<Authorization> = self.call(Method::GET, "/authorizations", Some(user), None).await?;
        Ok(authorizations
            .into_iter()
            .map(|authorization| ConnectionInfo {
                id: authorization.id,
                brokerage_name: authorization.brokerage.name,
                brokerage_slug: authorization.brokerage.slug,
            })
            .collect())
    }

    async fn list_accounts(&self, user: &BrokerageUser) -> Result<Vec<BrokerageAccount>, ProviderError> {
        let accounts: Vec<AccountBody> = self.call(Method::GET, "/accounts", Some(user), None).await?;
        Ok(accounts.into_iter().map(BrokerageAccount::from).collect())
    }

    async fn list_positions(&self, user: &BrokerageUser, account_id: &str) -> Result<Vec<Position>, ProviderError> {
        let endpoint = format!("/accounts/{account_id}/positions");
        let positions: Vec<PositionBody> = self.call(Method::GET, &endpoint, Some(user), None).await?;
        Ok(positions.into_iter().filter_map(PositionBody::into_position).collect())
    }

    async fn remove_connection(&self, user: &BrokerageUser, connection_id: &str) -> Result<(), ProviderError> {
        let endpoint = format!("/authorizations/{connection_id}");
        let _: Value = self.call(Method::DELETE, &endpoint, Some(user), None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use folio_storage::HttpClientConfig;

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join("brokerage")
            .join(name)
    }

    fn client() -> SnapTradeClient {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
        SnapTradeClient::new(
            SnapTradeConfig {
                client_id: "FOLIO-TEST".into(),
                consumer_key: "consumer-key".into(),
                base_url: "https://api.snaptrade.test/".into(),
            },
            http,
        )
    }

    #[test]
    fn payload_is_compact_with_sorted_keys() {
        let payload = signature_payload(
            "/api/v1/snapTrade/login",
            "clientId=abc&timestamp=1700000000",
            Some(&json!({ "connectionType": "read" })),
        )
        .expect("payload");
        assert_eq!(
            payload,
            r#"{"content":{"connectionType":"read"},"path":"/api/v1/snapTrade/login","query":"clientId=abc&timestamp=1700000000"}"#
        );

        let bodyless = signature_payload("/api/v1/accounts", "clientId=abc", None).expect("payload");
        assert_eq!(bodyless, r#"{"content":null,"path":"/api/v1/accounts","query":"clientId=abc"}"#);
    }

    #[test]
    fn signature_verifies_under_consumer_key() {
        let payload = r#"{"content":null,"path":"/api/v1/accounts","query":"clientId=abc"}"#;
        let signature = sign("consumer-key", payload).expect("sign");
        let raw = general_purpose::STANDARD.decode(&signature).expect("base64");

        let mut mac = HmacSha256::new_from_slice(b"consumer-key").expect("key");
        mac.update(payload.as_bytes());
        assert!(mac.verify_slice(&raw).is_ok());
        assert_ne!(signature, sign("other-key", payload).expect("sign"));
    }

    #[test]
    fn signed_request_carries_credentials_and_signature() {
        let user = BrokerageUser {
            user_id: "owner".into(),
            user_secret: "s3cret".into(),
        };
        let spec = client()
            .signed_request(Method::GET, "/accounts/acc-1/positions", Some(&user), None)
            .expect("request");

        let url = Url::parse(&spec.url).expect("url");
        assert_eq!(url.path(), "/api/v1/accounts/acc-1/positions");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let keys: Vec<&str> = pairs.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["clientId", "timestamp", "userId", "userSecret"]);

        let (name, signature) = &spec.headers[0];
        assert_eq!(name, "Signature");
        let expected_payload =
            signature_payload(url.path(), url.query().expect("query"), None).expect("payload");
        assert_eq!(signature, &sign("consumer-key", &expected_payload).expect("sign"));
    }

    #[test]
    fn accounts_fixture_maps_balances() {
        let bytes = std::fs::read(fixture("accounts.json")).expect("read fixture");
        let accounts: Vec<AccountBody> = decode_json(PROVIDER, &bytes).expect("decode");
        let accounts: Vec<BrokerageAccount> = accounts.into_iter().map(BrokerageAccount::from).collect();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "acc-brokerage");
        assert_eq!(accounts[0].balance, 15250.75);
        assert_eq!(accounts[0].currency, "USD");
        assert_eq!(accounts[1].balance, 0.0);
    }

    #[test]
    fn positions_fixture_values_only_long_priced_holdings() {
        let bytes = std::fs::read(fixture("positions.json")).expect("read fixture");
        let positions: Vec<PositionBody> = decode_json(PROVIDER, &bytes).expect("decode");
        let positions: Vec<Position> = positions.into_iter().filter_map(PositionBody::into_position).collect();

        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].symbol, "VTI");
        assert_eq!(positions[0].value_cents, 1_250_050);
        assert_eq!(positions[1].symbol, "AAPL");
        assert_eq!(positions[1].value_cents, 0);
    }

    #[test]
    fn error_body_code_is_kept() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 401,
            url: "u".into(),
            body: br#"{"detail":"Invalid userSecret","status_code":401,"code":"1076"}"#.to_vec(),
        });
        assert_eq!(err.failure_code(), "1076");
    }
}
