use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Server {
    pub listen: String,
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Withdrawals {
    #[serde(default = "default_minimum_cents")]
    pub minimum_cents: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Referrals {
    pub reward_cents: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Courses {
    pub catalog: Vec<i32>,
    pub course_price_cents: i64,
    pub all_courses_price_cents: i64,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Stripe {
    pub secret_key: String,
    pub webhook_secret: String,
    #[serde(default = "default_stripe_currency")]
    pub currency: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LiqPay {
    pub public_key: String,
    pub private_key: String,
    pub currency: String,
    pub server_url: String,
    #[serde(default = "default_liqpay_url")]
    pub api_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Monobank {
    pub token: String,
    pub webhook_url: String,
    #[serde(default)]
    pub apply_payments: bool,
    #[serde(default = "default_monobank_ccy")]
    pub ccy: u16,
    #[serde(default = "default_monobank_url")]
    pub api_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct YooKassa {
    pub shop_id: String,
    pub secret_key: String,
    pub currency: String,
    #[serde(default = "default_yookassa_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub postgres: Postgres,
    pub auth: Auth,
    pub withdrawals: Withdrawals,
    pub referrals: Referrals,
    pub courses: Courses,
    pub stripe: Option<Stripe>,
    pub liqpay: Option<LiqPay>,
    pub monobank: Option<Monobank>,
    pub yookassa: Option<YooKassa>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("EDU").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_minimum_cents() -> i64 {
    50 * 100
}

fn default_stripe_currency() -> String {
    "usd".to_string()
}

fn default_liqpay_url() -> String {
    "https://www.liqpay.ua".to_string()
}

fn default_monobank_ccy() -> u16 {
    980
}

fn default_monobank_url() -> String {
    "https://api.monobank.ua".to_string()
}

fn default_yookassa_url() -> String {
    "https://api.yookassa.ru".to_string()
}
