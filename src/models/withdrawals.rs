use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal,
};
use serde::{Deserialize, Serialize};

use super::users::AccountSummary;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "approved" => Ok(WithdrawalStatus::Approved),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            other => Err(format!("Unknown withdrawal status: {}", other)),
        }
    }
}

/// Admin verdict on a pending request. Only the two terminal states can be requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl From<Decision> for WithdrawalStatus {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approved => WithdrawalStatus::Approved,
            Decision::Rejected => WithdrawalStatus::Rejected,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub id: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub payment_method: String,
    pub payment_details: serde_json::Value,
    pub status: WithdrawalStatus,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewWithdrawal {
    pub user_id: String,
    pub amount_cents: i64,
    pub payment_method: String,
    pub payment_details: serde_json::Value,
}

/// Monetary amount as sent by clients: either a JSON number or a decimal string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Number(f64),
    Text(String),
}

impl Amount {
    pub fn to_cents(&self) -> Result<i64, String> {
        let value = match self {
            Amount::Number(n) => {
                if !n.is_finite() {
                    return Err("Amount is not a finite number.".to_string());
                }
                Decimal::from_f64(*n).ok_or_else(|| format!("Invalid amount: {}", n))?
            }
            Amount::Text(s) => {
                Decimal::from_str(s.trim()).map_err(|_| format!("Invalid amount: {}", s))?
            }
        };

        decimal_to_cents(value)
    }
}

fn decimal_to_cents(value: Decimal) -> Result<i64, String> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err("Amount must not be negative.".to_string());
    }

    let value = value.normalize();
    if value.scale() > 2 {
        return Err("Amount has more than two decimal places.".to_string());
    }

    (value * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| "Amount is out of range.".to_string())
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalBody {
    pub amount: Amount,
    pub payment_method: String,
    pub payment_details: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub id: String,
    pub status: Decision,
    pub admin_notes: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminWithdrawal {
    #[serde(flatten)]
    pub request: WithdrawalRequest,
    pub user: Option<AccountSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_and_strings_into_cents() {
        assert_eq!(Amount::Number(60.0).to_cents(), Ok(6000));
        assert_eq!(Amount::Number(50.5).to_cents(), Ok(5050));
        assert_eq!(Amount::Text("75.25".to_string()).to_cents(), Ok(7525));
        assert_eq!(Amount::Text(" 100 ".to_string()).to_cents(), Ok(10000));
        assert_eq!(Amount::Text("0".to_string()).to_cents(), Ok(0));
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert!(Amount::Text("ten dollars".to_string()).to_cents().is_err());
        assert!(Amount::Text("-5".to_string()).to_cents().is_err());
        assert!(Amount::Number(-0.5).to_cents().is_err());
        assert!(Amount::Number(f64::NAN).to_cents().is_err());
        assert!(Amount::Text("10.005".to_string()).to_cents().is_err());
    }

    #[test]
    fn decision_maps_onto_terminal_status() {
        assert_eq!(
            WithdrawalStatus::from(Decision::Rejected),
            WithdrawalStatus::Rejected
        );
        assert_eq!(
            WithdrawalStatus::from(Decision::Approved),
            WithdrawalStatus::Approved
        );
        assert_eq!("pending".parse(), Ok(WithdrawalStatus::Pending));
    }

    #[test]
    fn body_accepts_camel_case_fields() {
        let body: WithdrawalBody = serde_json::from_str(
            r#"{"amount": "60", "paymentMethod": "paypal", "paymentDetails": {"email": "a@b.c"}}"#,
        )
        .unwrap();

        assert_eq!(body.amount.to_cents(), Ok(6000));
        assert_eq!(body.payment_method, "paypal");
        assert!(body.payment_details.is_some());
    }
}
