//! Bank notification grammar shared by SMS, Telegram and screenshot text.

use regex::Captures;
use spendy_core::{Money, ParsedFields, TransactionKind};

use crate::parser::{
    find_datetime, finish, parse_amount, parse_currency, ParseFailure, ParseOutcome, ParseStrategy,
};

const MONTHS: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

pub struct BankMessageParser;

impl ParseStrategy for BankMessageParser {
    fn parse(&self, text: &str) -> ParseOutcome {
        let text = text.trim();
        if text.is_empty() {
            return ParseOutcome::Failed(ParseFailure::new("Empty payload"));
        }
        if let Some(reason) = skip_reason(text) {
            return ParseOutcome::Skipped { reason: reason.to_string() };
        }

        let mut fields = ParsedFields {
            card_last4: card_last4(text),
            transaction_datetime: find_datetime(text).map(|(dt, _)| dt),
            ..Default::default()
        };

        let matched = refund(text, &mut fields)
            .or_else(|| merchant_credit(text, &mut fields))
            .or_else(|| bill_payment(text, &mut fields))
            .or_else(|| purchase(text, &mut fields))
            .or_else(|| fallback(text, &mut fields));

        match matched {
            Some(Ok(())) => {}
            Some(Err(raw)) => {
                return ParseOutcome::Failed(ParseFailure::with_partial(
                    format!("Invalid amount format: {raw}"),
                    fields,
                ))
            }
            None => {
                fields.description = Some(collapse(text));
                return finish(fields);
            }
        }

        if fields.description.is_none() {
            let (merchant, location) = merchant_and_location(text);
            fields.description = Some(merchant.unwrap_or_else(|| collapse(text)));
            fields.location = location;
        }
        finish(fields)
    }
}

/// Non-transaction notices: statement summaries, reminders, beneficiaries.
fn skip_reason(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if text.contains("Mini Stmt") || text.contains("Statement date") {
        Some("Non-transaction message (statement)")
    } else if lower.contains("this is to remind you") || lower.contains("upcoming payment") {
        Some("Non-transaction message (reminder)")
    } else if lower.contains("beneficiary") {
        Some("Non-transaction message (beneficiary)")
    } else {
        None
    }
}

/// Writes currency and signed amount from capture groups. `Err` carries the
/// raw amount text when it does not parse.
fn apply_amount(
    fields: &mut ParsedFields,
    caps: &Captures<'_>,
    cur: usize,
    amt: usize,
    negative: bool,
) -> Result<(), String> {
    let raw = caps.get(amt).map(|m| m.as_str()).unwrap_or_default();
    let amount = parse_amount(raw)
        .and_then(Money::checked_abs)
        .and_then(|a| if negative { a.checked_neg() } else { Some(a) })
        .ok_or_else(|| raw.to_string())?;
    fields.amount = Some(amount);
    fields.currency = caps.get(cur).and_then(|m| parse_currency(m.as_str()));
    Ok(())
}

fn refund(text: &str, fields: &mut ParsedFields) -> Option<Result<(), String>> {
    let caps = re!(r"(?is)Purchase\s+amount\s+of\s+([A-Z]{3})\s+([\d,]+(?:\.\d{2})?)\s+at\s+(.+?)\s+on\s+your\s+Credit\s+Card.*?has\s+been\s+refunded")
        .captures(text)?;
    fields.kind = Some(TransactionKind::Refund);
    fields.description = caps.get(3).map(|m| collapse(m.as_str()));
    Some(apply_amount(fields, &caps, 1, 2, false))
}

fn merchant_credit(text: &str, fields: &mut ParsedFields) -> Option<Result<(), String>> {
    let caps = re!(r"(?is)Amount\s+of\s+([A-Z]{3})\s+([\d,]+(?:\.\d{2})?)\s+from\s+(.+?)\s+has\s+been\s+credited\s+to\s+your\s+card")
        .captures(text)?;
    fields.kind = Some(TransactionKind::Refund);
    fields.description = caps.get(3).map(|m| collapse(m.as_str()));
    Some(apply_amount(fields, &caps, 1, 2, false))
}

fn bill_payment(text: &str, fields: &mut ParsedFields) -> Option<Result<(), String>> {
    let caps = re!(r"(?is)([A-Z]{3})\s+([\d,]+(?:\.\d{2})?)\s+has\s+been\s+deducted\s+from\s+your\s+account.*?towards\s+payment\s+of\s+your\s+Credit\s+Card")
        .captures(text)?;
    fields.kind = Some(TransactionKind::Topup);
    fields.description = Some("Credit Card Bill Payment".to_string());
    Some(apply_amount(fields, &caps, 1, 2, false))
}

fn purchase(text: &str, fields: &mut ParsedFields) -> Option<Result<(), String>> {
    let caps = re!(r"(?i)\b(?:Purchase|Payment)\s+of\s+([A-Z]{3})\s+([\d,]+(?:\.\d{2})?)")
        .captures(text)?;
    fields.kind = Some(TransactionKind::Purchase);
    Some(apply_amount(fields, &caps, 1, 2, true))
}

/// Any `CUR 1.23` token, read as an expense. The description is the rest
/// of the text.
fn fallback(text: &str, fields: &mut ParsedFields) -> Option<Result<(), String>> {
    let caps = re!(r"\b([A-Z]{3})\s+([\d,]*\d(?:\.\d{2})?)\b")
        .captures_iter(text)
        .find(|c| c.get(1).is_some_and(|m| !MONTHS.contains(&m.as_str())))?;
    let whole = caps.get(0)?;
    fields.kind = Some(TransactionKind::Other);

    let mut rest = format!("{} {}", &text[..whole.start()], &text[whole.end()..]);
    if let Some((_, span)) = find_datetime(&rest) {
        rest.replace_range(span.range(), " ");
    }
    let rest = collapse(&rest);
    let rest = rest.trim_matches(|c: char| c.is_whitespace() || c == '.' || c == ',' || c == '-');
    if !rest.is_empty() && fields.description.is_none() {
        let (merchant, location) = merchant_and_location(text);
        match merchant {
            Some(m) => {
                fields.description = Some(m);
                fields.location = location;
            }
            None => fields.description = Some(rest.to_string()),
        }
    }
    Some(apply_amount(fields, &caps, 1, 2, true))
}

/// `at MERCHANT[, LOCATION]` or `to MERCHANT with Credit Card`.
fn merchant_and_location(text: &str) -> (Option<String>, Option<String>) {
    if let Some(caps) =
        re!(r"(?i)\s+at\s+(.+?)(?:\.\s*Avl|\s+on\s+your\s+Credit\s+Card|\.\s|\s*$)").captures(text)
    {
        let raw = caps.get(1).map(|m| m.as_str().trim().trim_end_matches('.')).unwrap_or_default();
        if !raw.is_empty() {
            if let Some((merchant, place)) = raw.rsplit_once(',') {
                let place = place.trim().trim_end_matches('.');
                if place.chars().next().is_some_and(char::is_uppercase) {
                    return (Some(collapse(merchant)), Some(place.to_string()));
                }
            }
            return (Some(collapse(raw)), None);
        }
    }
    let payee = re!(r"(?i)\s+to\s+([^.]+?)\s+with\s+Credit\s+Card")
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| collapse(m.as_str()));
    (payee, None)
}

fn card_last4(text: &str) -> Option<String> {
    re!(r"(?i)(?:Credit\s+)?card\s+ending\s+(?:with\s+)?(\d{4})")
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
