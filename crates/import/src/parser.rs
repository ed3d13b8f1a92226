//! Source-type dispatch for payload parsing.
//!
//! Each [`SourceType`] maps to one [`ParseStrategy`]. Strategies are pure:
//! they never touch storage and never panic on bad input.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Match;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spendy_core::transaction::validate_currency;
use spendy_core::{Money, ParsedFields, SourceType};
use std::collections::HashMap;
use std::str::FromStr;

use crate::manual::ManualEntryParser;
use crate::sms::BankMessageParser;
use crate::statement::StatementLineParser;

/// Why a payload could not be parsed, plus whatever was recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub reason: String,
    pub partial: ParsedFields,
}

impl ParseFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            partial: ParsedFields::default(),
        }
    }

    pub fn with_partial(reason: impl Into<String>, partial: ParsedFields) -> Self {
        Self {
            reason: reason.into(),
            partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedFields),
    /// A recognised message that does not describe a transaction.
    Skipped { reason: String },
    Failed(ParseFailure),
}

impl ParseOutcome {
    pub fn fields(&self) -> Option<&ParsedFields> {
        match self {
            ParseOutcome::Parsed(f) => Some(f),
            ParseOutcome::Failed(f) => Some(&f.partial),
            ParseOutcome::Skipped { .. } => None,
        }
    }
}

pub trait ParseStrategy: Send + Sync {
    fn parse(&self, text: &str) -> ParseOutcome;
}

/// Lookup table from source type to its parsing strategy.
pub struct Parser {
    strategies: HashMap<SourceType, Box<dyn ParseStrategy>>,
}

impl Default for Parser {
    fn default() -> Self {
        let mut strategies: HashMap<SourceType, Box<dyn ParseStrategy>> = HashMap::new();
        for t in [
            SourceType::TelegramText,
            SourceType::SmsText,
            SourceType::SmsScreenshot,
            SourceType::BankScreenshot,
        ] {
            strategies.insert(t, Box::new(BankMessageParser));
        }
        strategies.insert(SourceType::PdfStatement, Box::new(StatementLineParser));
        strategies.insert(SourceType::Manual, Box::new(ManualEntryParser));
        Self { strategies }
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the strategy for one source type.
    pub fn with_strategy(mut self, source_type: SourceType, strategy: Box<dyn ParseStrategy>) -> Self {
        self.strategies.insert(source_type, strategy);
        self
    }

    pub fn parse(&self, source_type: SourceType, text: &str) -> ParseOutcome {
        match self.strategies.get(&source_type) {
            Some(strategy) => strategy.parse(text),
            None => ParseOutcome::Failed(ParseFailure::new(format!(
                "No parser registered for source type '{source_type}'"
            ))),
        }
    }
}

/// Parses `1,493.10`-style amounts. `None` on malformed or overflowing input.
pub(crate) fn parse_amount(raw: &str) -> Option<Money> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    Decimal::from_str(&cleaned).ok().and_then(Money::from_decimal)
}

/// Uppercases and validates a currency code.
pub(crate) fn parse_currency(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    validate_currency(&code).ok().map(|_| code)
}

/// Final checks shared by every strategy once an amount has been found.
pub(crate) fn finish(fields: ParsedFields) -> ParseOutcome {
    match fields.amount {
        None => ParseOutcome::Failed(ParseFailure::with_partial("No amount found", fields)),
        Some(a) if a.is_zero() => {
            ParseOutcome::Failed(ParseFailure::with_partial("Amount is zero", fields))
        }
        Some(_) => ParseOutcome::Parsed(fields),
    }
}

/// Parses `YYYY-MM-DD` or `DD/MM/YYYY`.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

/// First datetime in `text` (ISO or `DD/MM/YYYY`, optional `HH:MM[:SS]`),
/// read as UTC, with the span it occupied.
pub(crate) fn find_datetime(text: &str) -> Option<(DateTime<Utc>, Match<'_>)> {
    let patterns = [
        re!(r"\b(\d{4}-\d{2}-\d{2})(?:[ T](\d{2}):(\d{2})(?::(\d{2}))?)?"),
        re!(r"\b(\d{2}/\d{2}/\d{4})(?:\s+(\d{2}):(\d{2})(?::(\d{2}))?)?"),
    ];
    patterns
        .iter()
        .filter_map(|re| {
            let caps = re.captures(text)?;
            let whole = caps.get(0)?;
            let date = parse_date(caps.get(1)?.as_str())?;
            let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
            let time = match (num(2), num(3)) {
                (Some(h), Some(m)) => NaiveTime::from_hms_opt(h, m, num(4).unwrap_or(0))?,
                _ => NaiveTime::MIN,
            };
            Some((Utc.from_utc_datetime(&date.and_time(time)), whole))
        })
        .min_by_key(|(_, m)| m.start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spendy_core::TransactionKind;

    #[test]
    fn dispatches_by_source_type() {
        let parser = Parser::new();
        let sms = parser.parse(SourceType::SmsText, "CARREFOUR AED 120.50");
        assert!(matches!(sms, ParseOutcome::Parsed(_)));

        let pdf = parser.parse(SourceType::PdfStatement, "15/01/2024 CARREFOUR 120.50");
        match pdf {
            ParseOutcome::Parsed(f) => assert_eq!(f.kind, Some(TransactionKind::Purchase)),
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    struct AlwaysSkip;

    impl ParseStrategy for AlwaysSkip {
        fn parse(&self, _text: &str) -> ParseOutcome {
            ParseOutcome::Skipped { reason: "test".into() }
        }
    }

    #[test]
    fn strategy_can_be_replaced() {
        let parser = Parser::new().with_strategy(SourceType::SmsText, Box::new(AlwaysSkip));
        assert!(matches!(
            parser.parse(SourceType::SmsText, "CARREFOUR AED 120.50"),
            ParseOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(parse_amount("1,493.10"), Some(Money::from_minor(149310)));
        assert_eq!(parse_amount("5"), Some(Money::from_minor(500)));
        assert_eq!(parse_amount("1.2.3"), None);
        assert_eq!(parse_amount("1.005"), None);
        assert_eq!(parse_amount("1.50"), Some(Money::from_minor(150)));
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn currency_parsing() {
        assert_eq!(parse_currency("aed").as_deref(), Some("AED"));
        assert_eq!(parse_currency("DIRHAM"), None);
    }

    #[test]
    fn finds_iso_and_dmy_datetimes() {
        let (dt, _) = find_datetime("paid 2024-01-15 10:30 ok").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
        let (dt, m) = find_datetime("on 16/01/2024 at X").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap());
        assert_eq!(m.as_str(), "16/01/2024");
        assert!(find_datetime("no date here").is_none());
        assert!(find_datetime("31/02/2024").is_none());
    }
}
