//! Hand-entered observations: a JSON object, or free text as a fallback.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use spendy_core::{Money, ParsedFields, TransactionKind};

use crate::parser::{finish, parse_currency, ParseFailure, ParseOutcome, ParseStrategy};
use crate::sms::BankMessageParser;

#[derive(Debug, Deserialize)]
struct ManualEntry {
    amount: Option<Decimal>,
    currency: Option<String>,
    description: Option<String>,
    transaction_datetime: Option<DateTime<Utc>>,
    posting_datetime: Option<DateTime<Utc>>,
    location: Option<String>,
    kind: Option<String>,
    card_last4: Option<String>,
}

pub struct ManualEntryParser;

impl ParseStrategy for ManualEntryParser {
    fn parse(&self, text: &str) -> ParseOutcome {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ParseOutcome::Failed(ParseFailure::new("Empty payload"));
        }
        match serde_json::from_str::<ManualEntry>(trimmed) {
            Ok(entry) => from_entry(entry),
            Err(e) => match BankMessageParser.parse(trimmed) {
                ParseOutcome::Parsed(fields) => ParseOutcome::Parsed(fields),
                _ if trimmed.starts_with('{') => ParseOutcome::Failed(ParseFailure::new(format!(
                    "Invalid manual entry JSON: {e}"
                ))),
                other => other,
            },
        }
    }
}

fn from_entry(entry: ManualEntry) -> ParseOutcome {
    let mut fields = ParsedFields {
        description: entry.description.filter(|d| !d.trim().is_empty()),
        transaction_datetime: entry.transaction_datetime,
        posting_datetime: entry.posting_datetime,
        location: entry.location,
        card_last4: entry.card_last4,
        ..Default::default()
    };
    if let Some(raw) = entry.currency {
        match parse_currency(&raw) {
            Some(code) => fields.currency = Some(code),
            None => {
                return ParseOutcome::Failed(ParseFailure::with_partial(
                    format!("Invalid currency: '{raw}'"),
                    fields,
                ))
            }
        }
    }
    if let Some(raw) = entry.kind {
        match raw.parse::<TransactionKind>() {
            Ok(kind) => fields.kind = Some(kind),
            Err(e) => return ParseOutcome::Failed(ParseFailure::with_partial(e, fields)),
        }
    }
    if let Some(amount) = entry.amount {
        match Money::from_decimal(amount) {
            Some(m) => fields.amount = Some(m),
            None => {
                return ParseOutcome::Failed(ParseFailure::with_partial(
                    format!("Invalid amount format: {amount}"),
                    fields,
                ))
            }
        }
    }
    finish(fields)
}
