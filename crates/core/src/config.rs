//! Layered settings: built-in defaults, overridden by an optional TOML file.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::source::SourceType;
use crate::transaction::CanonicalField;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub matching: MatchSettings,
    pub canonical: CanonicalSettings,
    pub fx: FxSettings,
}

impl Settings {
    /// Reads `path` if it exists; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.matching.validate()?;
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be at least 1".into(),
            ));
        }
        for pair in self.fx.rates.keys() {
            if split_pair(pair).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "fx rate key '{pair}' must look like 'USD/AED'"
                )));
            }
        }
        if let Some(url) = &self.fx.api_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "fx.api_base_url '{url}' must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// Anchors relative database and upload paths under `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
        if self.storage.uploads_dir.is_relative() {
            self.storage.uploads_dir = base.join(&self.storage.uploads_dir);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    /// SQLite has a single writer; more than one connection only helps reads.
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spendy.db"),
            max_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub uploads_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchSettings {
    /// Candidates further than this from the incoming datetime are ignored.
    pub window_hours: i64,
    /// At or above: link automatically to the best candidate.
    pub auto_link_threshold: f64,
    /// At or above (and below auto-link): surface candidates for review.
    pub ambiguous_threshold: f64,
    pub datetime_weight: f64,
    pub description_weight: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            window_hours: 48,
            auto_link_threshold: 0.80,
            ambiguous_threshold: 0.50,
            datetime_weight: 0.5,
            description_weight: 0.5,
        }
    }
}

impl MatchSettings {
    pub fn window(&self) -> Duration {
        Duration::hours(self.window_hours)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if self.window_hours <= 0 {
            return Err(ConfigError::Invalid("matching.window_hours must be positive".into()));
        }
        if !in_unit(self.auto_link_threshold) || !in_unit(self.ambiguous_threshold) {
            return Err(ConfigError::Invalid("match thresholds must lie in [0, 1]".into()));
        }
        if self.ambiguous_threshold > self.auto_link_threshold {
            return Err(ConfigError::Invalid(
                "matching.ambiguous_threshold cannot exceed auto_link_threshold".into(),
            ));
        }
        if self.datetime_weight < 0.0
            || self.description_weight < 0.0
            || self.datetime_weight + self.description_weight <= 0.0
        {
            return Err(ConfigError::Invalid(
                "match weights must be non-negative with a positive sum".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalSettings {
    pub priority: PriorityPolicy,
}

/// Per-field source preference. Fields missing from the map use the
/// built-in order; source types missing from a list rank after all listed
/// ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityPolicy(BTreeMap<CanonicalField, Vec<SourceType>>);

impl PriorityPolicy {
    pub fn new(order: BTreeMap<CanonicalField, Vec<SourceType>>) -> Self {
        PriorityPolicy(order)
    }

    pub fn with_order(mut self, field: CanonicalField, order: Vec<SourceType>) -> Self {
        self.0.insert(field, order);
        self
    }

    pub fn order(&self, field: CanonicalField) -> Vec<SourceType> {
        self.0
            .get(&field)
            .cloned()
            .unwrap_or_else(|| default_order(field).to_vec())
    }

    /// Lower is preferred.
    pub fn rank(&self, field: CanonicalField, source_type: SourceType) -> usize {
        let order = self.order(field);
        order
            .iter()
            .position(|t| *t == source_type)
            .unwrap_or(order.len())
    }
}

fn default_order(field: CanonicalField) -> &'static [SourceType] {
    use SourceType::*;
    match field {
        CanonicalField::Amount | CanonicalField::Description => &[
            PdfStatement,
            SmsText,
            TelegramText,
            BankScreenshot,
            SmsScreenshot,
            Manual,
        ],
        CanonicalField::TransactionDatetime => &[
            SmsText,
            TelegramText,
            SmsScreenshot,
            BankScreenshot,
            Manual,
            PdfStatement,
        ],
        CanonicalField::PostingDatetime => &[
            PdfStatement,
            BankScreenshot,
            SmsText,
            TelegramText,
            SmsScreenshot,
            Manual,
        ],
        CanonicalField::Location | CanonicalField::Kind => &[
            SmsText,
            TelegramText,
            SmsScreenshot,
            BankScreenshot,
            PdfStatement,
            Manual,
        ],
    }
}

/// Exchange rates: static pairs keyed `"FROM/TO"`, plus an optional rate
/// service consulted for pairs not listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FxSettings {
    pub rates: BTreeMap<String, Decimal>,
    pub api_base_url: Option<String>,
    pub cache_ttl_secs: u64,
}

impl Default for FxSettings {
    fn default() -> Self {
        Self {
            rates: BTreeMap::new(),
            api_base_url: None,
            cache_ttl_secs: 3600,
        }
    }
}

pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (from, to) = pair.split_once('/')?;
    let valid = |c: &str| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_uppercase());
    (valid(from) && valid(to)).then_some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.matching, MatchSettings::default());
        assert_eq!(s.database.max_connections, 1);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let s = Settings::from_toml(
            r#"
            [matching]
            auto_link_threshold = 0.9

            [canonical.priority]
            description = ["sms_text", "pdf_statement"]

            [fx.rates]
            "USD/AED" = "3.6725"
            "#,
        )
        .unwrap();
        assert_eq!(s.matching.auto_link_threshold, 0.9);
        assert_eq!(s.matching.window_hours, 48);
        let policy = &s.canonical.priority;
        assert_eq!(policy.rank(CanonicalField::Description, SourceType::SmsText), 0);
        assert_eq!(policy.rank(CanonicalField::Description, SourceType::Manual), 2);
        // untouched field keeps the built-in order
        assert_eq!(policy.rank(CanonicalField::Amount, SourceType::PdfStatement), 0);
        assert_eq!(s.fx.rates["USD/AED"], Decimal::new(36725, 4));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = Settings::from_toml(
            "[matching]\nauto_link_threshold = 0.4\nambiguous_threshold = 0.6\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_fx_pair() {
        let err = Settings::from_toml("[fx.rates]\n\"usd-aed\" = \"3.67\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn fx_service_settings() {
        let s = Settings::from_toml(
            "[fx]\napi_base_url = \"https://v6.exchangerate-api.com\"\ncache_ttl_secs = 600\n",
        )
        .unwrap();
        assert_eq!(s.fx.api_base_url.as_deref(), Some("https://v6.exchangerate-api.com"));
        assert_eq!(s.fx.cache_ttl_secs, 600);
        assert_eq!(Settings::default().fx.cache_ttl_secs, 3600);

        let err = Settings::from_toml("[fx]\napi_base_url = \"rates.local\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn resolve_paths_keeps_absolute() {
        let mut s = Settings::default();
        s.storage.uploads_dir = PathBuf::from("/srv/uploads");
        s.resolve_paths(Path::new("/data"));
        assert_eq!(s.database.path, PathBuf::from("/data/spendy.db"));
        assert_eq!(s.storage.uploads_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn load_missing_file_is_default() {
        let s = Settings::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(s.matching.window_hours, 48);
    }
}
