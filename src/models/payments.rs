use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    LiqPay,
    Monobank,
    YooKassa,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::LiqPay => "liqpay",
            PaymentProvider::Monobank => "monobank",
            PaymentProvider::YooKassa => "yookassa",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(PaymentProvider::Stripe),
            "liqpay" => Ok(PaymentProvider::LiqPay),
            "monobank" => Ok(PaymentProvider::Monobank),
            "yookassa" => Ok(PaymentProvider::YooKassa),
            other => Err(format!("Unknown payment provider: {}", other)),
        }
    }
}

/// What a payment buys: one catalog course, or the whole catalog (`"all"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CourseSelection {
    All,
    Course(i32),
}

impl CourseSelection {
    pub fn course_ids(&self, catalog: &[i32]) -> Vec<i32> {
        match self {
            CourseSelection::All => catalog.to_vec(),
            CourseSelection::Course(id) => vec![*id],
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, CourseSelection::All)
    }
}

impl fmt::Display for CourseSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourseSelection::All => f.write_str("all"),
            CourseSelection::Course(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for CourseSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(CourseSelection::All);
        }

        s.parse::<i32>()
            .map(CourseSelection::Course)
            .map_err(|_| format!("Invalid course id: {}", s))
    }
}

impl Serialize for CourseSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CourseSelection::All => serializer.serialize_str("all"),
            CourseSelection::Course(id) => serializer.serialize_i32(*id),
        }
    }
}

impl<'de> Deserialize<'de> for CourseSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(i32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(CourseSelection::Course(id)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Order reference carried through every provider so notifications can be matched to
/// an account without trusting payer-supplied emails. Encoded as `user:course:nonce`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderReference {
    pub user_id: String,
    pub course: CourseSelection,
    pub nonce: String,
}

impl OrderReference {
    pub fn new(user_id: &str, course: CourseSelection) -> Self {
        Self {
            user_id: user_id.to_string(),
            course,
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }
}

impl fmt::Display for OrderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.course, self.nonce)
    }
}

impl FromStr for OrderReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user_id), Some(course), Some(nonce)) if !user_id.is_empty() => Ok(Self {
                user_id: user_id.to_string(),
                course: course.parse()?,
                nonce: nonce.to_string(),
            }),
            _ => Err(format!("Malformed order reference: {}", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CustomerRef {
    UserId(String),
    Email(String),
}

/// Provider-independent success notification.
#[derive(Clone, Debug)]
pub struct PaymentSucceeded {
    pub provider: PaymentProvider,
    pub external_id: String,
    pub customer: CustomerRef,
    pub course: CourseSelection,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Granted { user_id: String },
    Duplicate,
    UnknownCustomer,
    Ignored { reason: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLog {
    pub id: String,
    pub user_id: String,
    pub provider: PaymentProvider,
    pub external_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewPaymentLog {
    pub user_id: String,
    pub provider: PaymentProvider,
    pub external_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct CheckoutOrder {
    pub reference: OrderReference,
    pub email: String,
    pub amount_cents: i64,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub provider: PaymentProvider,
    pub external_id: String,
    pub redirect_url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub provider: PaymentProvider,
    pub course_id: CourseSelection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ProviderPaymentStatus {
    pub state: PaymentState,
    pub reference: Option<OrderReference>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub provider: PaymentProvider,
    pub external_id: String,
    pub state: PaymentState,
    pub reconciliation: Option<ReconciliationResult>,
}

/// Parses a provider's decimal amount string ("149.00") into cents.
pub fn decimal_str_to_cents(value: &str) -> Option<i64> {
    let (whole, fraction) = match value.trim().split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value.trim(), ""),
    };
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = whole.parse().ok()?;
    let fraction: i64 = format!("{:0<2}", fraction).parse().ok()?;
    whole.checked_mul(100)?.checked_add(fraction)
}

/// Formats cents as a two-decimal string, the way the providers expect amounts.
pub fn cents_to_decimal_str(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_reference_survives_encoding() {
        let reference = OrderReference::new("6f1c2f4e-user", CourseSelection::All);
        let parsed: OrderReference = reference.to_string().parse().unwrap();
        assert_eq!(parsed, reference);

        let single: OrderReference = "u1:3:abc".parse().unwrap();
        assert_eq!(single.course, CourseSelection::Course(3));
        assert!("no-separators".parse::<OrderReference>().is_err());
        assert!(":all:abc".parse::<OrderReference>().is_err());
    }

    #[test]
    fn course_selection_accepts_numbers_and_all() {
        let all: CourseSelection = serde_json::from_str(r#""all""#).unwrap();
        let numeric: CourseSelection = serde_json::from_str("2").unwrap();
        let text: CourseSelection = serde_json::from_str(r#""4""#).unwrap();

        assert_eq!(all, CourseSelection::All);
        assert_eq!(numeric, CourseSelection::Course(2));
        assert_eq!(text, CourseSelection::Course(4));
        assert_eq!(all.course_ids(&[1, 2, 3, 4]), vec![1, 2, 3, 4]);
        assert_eq!(numeric.course_ids(&[1, 2, 3, 4]), vec![2]);
    }

    #[test]
    fn provider_amounts_convert_to_cents() {
        assert_eq!(decimal_str_to_cents("149.00"), Some(14900));
        assert_eq!(decimal_str_to_cents("49.5"), Some(4950));
        assert_eq!(decimal_str_to_cents("12"), Some(1200));
        assert_eq!(decimal_str_to_cents("1.234"), None);
        assert_eq!(cents_to_decimal_str(14900), "149.00");
        assert_eq!(cents_to_decimal_str(4905), "49.05");
    }
}
