//! One row of a card statement, as extracted from a PDF.

use chrono::{DateTime, TimeZone, Utc};
use spendy_core::{ParsedFields, TransactionKind};

use crate::parser::{finish, parse_amount, parse_currency, parse_date, ParseFailure, ParseOutcome, ParseStrategy};

/// Reads the first line shaped like
/// `DATE [POSTING_DATE] DESCRIPTION [CUR] AMOUNT [CR]`. Debits come out
/// negative; `CR` (or a leading minus) marks a positive refund.
pub struct StatementLineParser;

impl ParseStrategy for StatementLineParser {
    fn parse(&self, text: &str) -> ParseOutcome {
        if text.trim().is_empty() {
            return ParseOutcome::Failed(ParseFailure::new("Empty payload"));
        }
        let row = re!(r"(?m)^\s*(\d{4}-\d{2}-\d{2}|\d{2}/\d{2}/\d{4})\s+(?:(\d{4}-\d{2}-\d{2}|\d{2}/\d{2}/\d{4})\s+)?(.+?)\s+(?:([A-Z]{3})\s+)?(-?[\d,]*\d\.\d{2})(?:\s*(CR))?\s*$");

        let Some(caps) = row.captures_iter(text).find(|c| {
            c.get(1).and_then(|m| parse_date(m.as_str())).is_some()
        }) else {
            return ParseOutcome::Failed(ParseFailure::new("No statement row found"));
        };

        let day = |i: usize| -> Option<DateTime<Utc>> {
            let date = parse_date(caps.get(i)?.as_str())?;
            Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
        };
        let transaction_datetime = day(1);
        let posting_datetime = day(2).or(transaction_datetime);

        let mut fields = ParsedFields {
            transaction_datetime,
            posting_datetime,
            description: caps
                .get(3)
                .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" ")),
            currency: caps.get(4).and_then(|m| parse_currency(m.as_str())),
            ..Default::default()
        };

        let raw = caps.get(5).map(|m| m.as_str()).unwrap_or_default();
        let Some(amount) = parse_amount(raw) else {
            return ParseOutcome::Failed(ParseFailure::with_partial(
                format!("Invalid amount format: {raw}"),
                fields,
            ));
        };
        let credit = caps.get(6).is_some() || amount.is_negative();
        let (signed, kind) = if credit {
            (amount.checked_abs(), TransactionKind::Refund)
        } else {
            (amount.checked_neg(), TransactionKind::Purchase)
        };
        let Some(signed) = signed else {
            return ParseOutcome::Failed(ParseFailure::with_partial(
                format!("Invalid amount format: {raw}"),
                fields,
            ));
        };
        fields.amount = Some(signed);
        fields.kind = Some(kind);
        finish(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spendy_core::Money;

    fn parsed(text: &str) -> ParsedFields {
        match StatementLineParser.parse(text) {
            ParseOutcome::Parsed(f) => f,
            other => panic!("expected parsed for {text:?}, got {other:?}"),
        }
    }

    #[test]
    fn debit_row_with_both_dates() {
        let f = parsed("14/01/2024 15/01/2024 CARREFOUR CITY CENTRE AED 120.50");
        assert_eq!(f.amount, Some(Money::from_minor(-12050)));
        assert_eq!(f.currency.as_deref(), Some("AED"));
        assert_eq!(f.description.as_deref(), Some("CARREFOUR CITY CENTRE"));
        assert_eq!(f.kind, Some(TransactionKind::Purchase));
        assert_eq!(
            f.transaction_datetime,
            Some(Utc.with_ymd_and_hms(2024, 1, 14, 0, 0, 0).unwrap())
        );
        assert_eq!(
            f.posting_datetime,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn single_date_is_also_posting_date() {
        let f = parsed("2024-01-15 NOON.COM 1,200.00");
        assert_eq!(f.posting_datetime, f.transaction_datetime);
        assert_eq!(f.currency, None);
        assert_eq!(f.amount, Some(Money::from_minor(-120000)));
    }

    #[test]
    fn credit_rows_are_positive_refunds() {
        let f = parsed("15/01/2024 AMAZON REFUND 149.00 CR");
        assert_eq!(f.amount, Some(Money::from_minor(14900)));
        assert_eq!(f.kind, Some(TransactionKind::Refund));
        assert_eq!(f.description.as_deref(), Some("AMAZON REFUND"));
    }

    #[test]
    fn out_of_range_amount_fails_cleanly() {
        match StatementLineParser.parse("15/01/2024 SHOP -92233720368547758.08") {
            ParseOutcome::Failed(f) => {
                assert!(f.reason.starts_with("Invalid amount format"), "{}", f.reason);
                assert_eq!(f.partial.description.as_deref(), Some("SHOP"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(
            StatementLineParser.parse("15/01/2024 SHOP 92233720368547758.08"),
            ParseOutcome::Failed(_)
        ));
    }

    #[test]
    fn skips_header_lines() {
        let text = "Statement of account\nDate Description Amount\n15/01/2024 LULU 45.00\n";
        assert_eq!(parsed(text).description.as_deref(), Some("LULU"));
    }

    #[test]
    fn no_row_fails() {
        assert!(matches!(
            StatementLineParser.parse("Opening balance only"),
            ParseOutcome::Failed(_)
        ));
        assert!(matches!(StatementLineParser.parse(""), ParseOutcome::Failed(_)));
    }
}
