//! Connection health state machines for the two aggregators.
//!
//! Both machines are pure: a current state plus an observed outcome yields
//! the next state. Persisting the result is the sync engine's job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Health of a bank/credit item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankHealth {
    #[default]
    Ok,
    LoginRequired,
}

/// Error codes that mean the owner has to reconnect the item.
pub const BANK_REAUTH_CODES: &[&str] = &[
    "ITEM_LOGIN_REQUIRED",
    "INVALID_ACCESS_TOKEN",
    "ACCESS_TOKEN_EXPIRED",
    "ACCESS_TOKEN_INVALID",
    "INVALID_CREDENTIALS",
    "ITEM_ERROR",
];

/// Error codes that are expected to clear up on their own.
pub const BANK_TRANSIENT_CODES: &[&str] = &[
    "RATE_LIMIT_EXCEEDED",
    "INSTITUTION_DOWN",
    "INSTITUTION_NOT_RESPONDING",
    "INSTITUTION_NOT_AVAILABLE",
    "INTERNAL_SERVER_ERROR",
    "PLANNED_MAINTENANCE",
    "PRODUCT_NOT_READY",
    "TIMEOUT",
    "NETWORK_ERROR",
    "HTTP_429",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankFailureKind {
    ReauthRequired,
    Transient,
}

/// Classifies a bank aggregator error code. Anything outside the transient
/// set, `BANK_REAUTH_CODES` or not, fails closed.
pub fn classify_bank_error(code: &str) -> BankFailureKind {
    let code = code.trim();
    if BANK_TRANSIENT_CODES.contains(&code) || is_http_server_error_code(code) {
        BankFailureKind::Transient
    } else {
        BankFailureKind::ReauthRequired
    }
}

fn is_http_server_error_code(code: &str) -> bool {
    code.strip_prefix("HTTP_")
        .and_then(|status| status.parse::<u16>().ok())
        .is_some_and(|status| (500..600).contains(&status))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankOutcome<'a> {
    Success,
    Failure { code: &'a str },
}

impl BankHealth {
    pub fn next(self, outcome: BankOutcome<'_>) -> BankHealth {
        match outcome {
            BankOutcome::Success => BankHealth::Ok,
            BankOutcome::Failure { code } => match classify_bank_error(code) {
                BankFailureKind::ReauthRequired => BankHealth::LoginRequired,
                BankFailureKind::Transient => self,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BankHealth::Ok => "OK",
            BankHealth::LoginRequired => "LOGIN_REQUIRED",
        }
    }
}

/// Health of a brokerage connection under the two-strike rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerageHealth {
    #[default]
    Ok,
    AccountFetchError,
    ConnectionError,
}

/// Which of the two sequential brokerage probes failed, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerageProbe {
    Healthy,
    ConnectionsFailed,
    AccountsFailed,
}

impl BrokerageHealth {
    pub fn escalate(self) -> BrokerageHealth {
        match self {
            BrokerageHealth::Ok => BrokerageHealth::AccountFetchError,
            BrokerageHealth::AccountFetchError | BrokerageHealth::ConnectionError => {
                BrokerageHealth::ConnectionError
            }
        }
    }

    pub fn next(self, probe: BrokerageProbe) -> BrokerageHealth {
        match probe {
            BrokerageProbe::Healthy => BrokerageHealth::Ok,
            BrokerageProbe::ConnectionsFailed | BrokerageProbe::AccountsFailed => self.escalate(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BrokerageHealth::Ok => "OK",
            BrokerageHealth::AccountFetchError => "ACCOUNT_FETCH_ERROR",
            BrokerageHealth::ConnectionError => "CONNECTION_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown health status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for BankHealth {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(BankHealth::Ok),
            // Older rows carry the aggregator's own code.
            "LOGIN_REQUIRED" | "ITEM_LOGIN_REQUIRED" => Ok(BankHealth::LoginRequired),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl FromStr for BrokerageHealth {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(BrokerageHealth::Ok),
            "ACCOUNT_FETCH_ERROR" => Ok(BrokerageHealth::AccountFetchError),
            "CONNECTION_ERROR" => Ok(BrokerageHealth::ConnectionError),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for BankHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BrokerageHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_account_failures_escalate_then_saturate() {
        let mut state = BrokerageHealth::Ok;
        let mut seen = Vec::new();
        for _ in 0..3 {
            state = state.next(BrokerageProbe::AccountsFailed);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                BrokerageHealth::AccountFetchError,
                BrokerageHealth::ConnectionError,
                BrokerageHealth::ConnectionError,
            ]
        );
    }

    #[test]
    fn connection_list_failure_escalates_one_step() {
        assert_eq!(
            BrokerageHealth::Ok.next(BrokerageProbe::ConnectionsFailed),
            BrokerageHealth::AccountFetchError
        );
        assert_eq!(
            BrokerageHealth::AccountFetchError.next(BrokerageProbe::ConnectionsFailed),
            BrokerageHealth::ConnectionError
        );
    }

    #[test]
    fn one_success_resets_any_brokerage_state() {
        for state in [
            BrokerageHealth::Ok,
            BrokerageHealth::AccountFetchError,
            BrokerageHealth::ConnectionError,
        ] {
            assert_eq!(state.next(BrokerageProbe::Healthy), BrokerageHealth::Ok);
        }
    }

    #[test]
    fn reauth_codes_require_login() {
        for code in BANK_REAUTH_CODES {
            assert_eq!(
                BankHealth::Ok.next(BankOutcome::Failure { code }),
                BankHealth::LoginRequired,
                "{code}"
            );
        }
    }

    #[test]
    fn transient_codes_leave_status_unchanged() {
        for code in BANK_TRANSIENT_CODES.iter().copied().chain(["HTTP_500", "HTTP_502", "HTTP_503", "HTTP_599"]) {
            assert_eq!(BankHealth::Ok.next(BankOutcome::Failure { code }), BankHealth::Ok, "{code}");
            assert_eq!(
                BankHealth::LoginRequired.next(BankOutcome::Failure { code }),
                BankHealth::LoginRequired,
                "{code}"
            );
        }
    }

    #[test]
    fn unknown_codes_fail_closed() {
        for code in ["SOMETHING_NEW", "", "HTTP_400", "HTTP_499", "HTTP_600", "UNRECOGNIZED_RESPONSE"] {
            assert_eq!(classify_bank_error(code), BankFailureKind::ReauthRequired, "{code}");
        }
    }

    #[test]
    fn success_recovers_bank_item() {
        assert_eq!(BankHealth::LoginRequired.next(BankOutcome::Success), BankHealth::Ok);
    }

    #[test]
    fn statuses_round_trip_through_their_wire_names() {
        assert_eq!("ITEM_LOGIN_REQUIRED".parse::<BankHealth>(), Ok(BankHealth::LoginRequired));
        assert_eq!(
            BrokerageHealth::AccountFetchError.as_str().parse::<BrokerageHealth>(),
            Ok(BrokerageHealth::AccountFetchError)
        );
        assert_eq!(
            serde_json::to_string(&BrokerageHealth::ConnectionError).expect("json"),
            "\"CONNECTION_ERROR\""
        );
        assert_eq!(serde_json::to_string(&BankHealth::Ok).expect("json"), "\"OK\"");
        assert!("BROKEN".parse::<BrokerageHealth>().is_err());
    }
}
