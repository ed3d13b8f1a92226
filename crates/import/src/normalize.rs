//! Merchant description normalisation shared by fingerprinting and matching.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Tokens that carry no merchant identity.
const NOISE: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "at", "in", "on", "to", "for", "by", "with", "from",
    "pos", "visa", "mastercard", "mc", "amex", "debit", "credit", "purchase", "payment", "card",
    "txn", "trx", "ref", "no", "auth",
];

/// Lowercased, diacritic-free merchant key. Masked card numbers, reference
/// numbers and boilerplate tokens are removed. `normalize(normalize(x)) ==
/// normalize(x)`.
pub fn normalize(description: &str) -> String {
    let folded: String = description
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    let unmasked = re!(r"[x*]{4,}[\s-]?\d{4}").replace_all(&folded, " ");

    unmasked
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| !(t.len() >= 5 && t.chars().all(|c| c.is_ascii_digit())))
        .filter(|t| !NOISE.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses() {
        assert_eq!(normalize("  CARREFOUR   Mall  "), "carrefour mall");
    }

    #[test]
    fn strips_diacritics() {
        assert_eq!(normalize("Café Nérö"), "cafe nero");
    }

    #[test]
    fn drops_masks_references_and_noise() {
        assert_eq!(
            normalize("POS Purchase at CARREFOUR card XXXX3278 ref 884213377"),
            "carrefour"
        );
        assert_eq!(normalize("Visa txn: STARBUCKS #12"), "starbucks 12");
    }

    #[test]
    fn punctuation_becomes_separator() {
        assert_eq!(normalize("AMAZON.AE*MKTP"), "amazon ae mktp");
    }

    #[test]
    fn idempotent() {
        for s in [
            "CARREFOUR AED",
            "Café Nérö, Dubai Mall",
            "POS 4111****1234 LULU HYPERMARKET 1234567",
            "",
        ] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "input {s:?}");
        }
    }

    #[test]
    fn deterministic_for_equal_input() {
        assert_eq!(normalize("Noon.com"), normalize("NOON.COM"));
    }
}
