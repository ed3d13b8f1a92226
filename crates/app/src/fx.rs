use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use spendy_core::config::{split_pair, FxSettings};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FxError {
    #[error("No exchange rate for {from}/{to}")]
    Unsupported { from: String, to: String },
    #[error("Exchange rate service unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for FxError {
    fn from(e: reqwest::Error) -> Self {
        FxError::Unavailable(e.to_string())
    }
}

/// Exchange rates used to bring observations into their card's currency.
#[async_trait]
pub trait FxRates: Send + Sync {
    /// Units of `to` per unit of `from`.
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, FxError>;
}

/// Builds the rate source named by `[fx]`: the HTTP provider when
/// `api_base_url` is set (configured rates still answer first), otherwise
/// the configured rates alone.
pub fn from_settings(settings: &FxSettings) -> Result<Arc<dyn FxRates>, FxError> {
    let fixed = StaticFxRates::from_settings(settings);
    match settings.api_base_url.as_deref() {
        Some(base_url) => {
            let ttl = Duration::from_secs(settings.cache_ttl_secs);
            Ok(Arc::new(HttpFxRates::new(base_url, ttl)?.with_overrides(fixed)))
        }
        None => Ok(Arc::new(fixed)),
    }
}

/// Fixed rates from configuration. A pair can be answered from either
/// direction.
#[derive(Debug, Clone, Default)]
pub struct StaticFxRates {
    rates: HashMap<(String, String), Decimal>,
}

impl StaticFxRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates.insert((from.to_string(), to.to_string()), rate);
        self
    }

    pub fn from_settings(settings: &FxSettings) -> Self {
        settings
            .rates
            .iter()
            .filter_map(|(pair, rate)| split_pair(pair).map(|(f, t)| (f, t, *rate)))
            .fold(Self::new(), |acc, (from, to, rate)| acc.with_rate(from, to, rate))
    }

    pub fn lookup(&self, from: &str, to: &str) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        if let Some(rate) = self.rates.get(&(from.to_string(), to.to_string())) {
            return Some(*rate);
        }
        self.rates
            .get(&(to.to_string(), from.to_string()))
            .filter(|r| !r.is_zero())
            .and_then(|r| Decimal::ONE.checked_div(*r))
            .map(|r| r.round_dp(10))
    }
}

#[async_trait]
impl FxRates for StaticFxRates {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, FxError> {
        self.lookup(from, to).ok_or_else(|| FxError::Unsupported {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    result: String,
    #[serde(default)]
    rates: HashMap<String, JsonValue>,
}

struct CachedRates {
    rates: HashMap<String, Decimal>,
    fetched_at: Instant,
}

/// Latest rates from an exchange-rate API (`GET {base}/v6/latest/{FROM}`),
/// cached per base currency for `ttl`.
pub struct HttpFxRates {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    overrides: StaticFxRates,
    cache: Mutex<HashMap<String, CachedRates>>,
}

impl HttpFxRates {
    pub fn new(base_url: &str, ttl: Duration) -> Result<Self, FxError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            overrides: StaticFxRates::new(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Rates answered locally before the service is asked.
    pub fn with_overrides(mut self, overrides: StaticFxRates) -> Self {
        self.overrides = overrides;
        self
    }

    async fn fetch(&self, base: &str) -> Result<HashMap<String, Decimal>, FxError> {
        let url = format!("{}/v6/latest/{}", self.base_url, base);
        tracing::debug!(%url, "fetching exchange rates");
        let body: LatestRates = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.result != "success" {
            return Err(FxError::Unavailable(format!(
                "rates for {base} returned result '{}'",
                body.result
            )));
        }
        Ok(body
            .rates
            .into_iter()
            .filter_map(|(currency, value)| parse_rate(&value).map(|rate| (currency, rate)))
            .collect())
    }
}

fn parse_rate(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        _ => return None,
    };
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .filter(|r| r.is_sign_positive() && !r.is_zero())
}

#[async_trait]
impl FxRates for HttpFxRates {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, FxError> {
        if let Some(rate) = self.overrides.lookup(from, to) {
            return Ok(rate);
        }
        let unsupported = || FxError::Unsupported {
            from: from.to_string(),
            to: to.to_string(),
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(from) {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.rates.get(to).copied().ok_or_else(unsupported);
            }
        }
        let rates = self.fetch(from).await?;
        let rate = rates.get(to).copied();
        cache.insert(
            from.to_string(),
            CachedRates {
                rates,
                fetched_at: Instant::now(),
            },
        );
        rate.ok_or_else(unsupported)
    }
}
