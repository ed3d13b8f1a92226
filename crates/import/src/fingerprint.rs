//! Deterministic identity hint for a canonical transaction.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use spendy_core::{CardId, Money};

/// Inputs to a fingerprint. `merchant_norm` must already be normalised.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintInput<'a> {
    pub card_id: CardId,
    pub date_bucket: Option<NaiveDate>,
    pub amount: Money,
    pub currency: &'a str,
    pub merchant_norm: &'a str,
}

/// Plain `card|date|amount|currency|merchant` key, kept for debugging.
pub fn fingerprint_key(input: &FingerprintInput<'_>) -> String {
    let date = input
        .date_bucket
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "{}|{}|{}|{}|{}",
        input.card_id,
        date,
        input.amount.to_decimal(),
        input.currency,
        input.merchant_norm
    )
}

/// SHA-256 hex of [`fingerprint_key`].
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let digest = Sha256::digest(fingerprint_key(input).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(minor: i64, merchant: &'a str) -> FingerprintInput<'a> {
        FingerprintInput {
            card_id: CardId(7),
            date_bucket: NaiveDate::from_ymd_opt(2024, 1, 15),
            amount: Money::from_minor(minor),
            currency: "AED",
            merchant_norm: merchant,
        }
    }

    #[test]
    fn key_layout() {
        assert_eq!(
            fingerprint_key(&input(-12050, "carrefour")),
            "7|2024-01-15|-120.50|AED|carrefour"
        );
        let mut undated = input(500, "lulu");
        undated.date_bucket = None;
        assert_eq!(fingerprint_key(&undated), "7|unknown|5.00|AED|lulu");
    }

    #[test]
    fn deterministic_hex() {
        let a = fingerprint(&input(-12050, "carrefour"));
        assert_eq!(a, fingerprint(&input(-12050, "carrefour")));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn any_component_changes_hash() {
        let base = fingerprint(&input(-12050, "carrefour"));
        assert_ne!(base, fingerprint(&input(-12051, "carrefour")));
        assert_ne!(base, fingerprint(&input(-12050, "lulu")));
        let mut other_card = input(-12050, "carrefour");
        other_card.card_id = CardId(8);
        assert_ne!(base, fingerprint(&other_card));
    }
}
