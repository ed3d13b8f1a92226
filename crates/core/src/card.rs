use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CardId(pub i64);

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub account_id: Option<i64>,
    pub masked_number: String,
    pub name: String,
    /// Settlement currency of the account behind the card.
    pub currency: Option<String>,
}

/// Last four digits of a masked number, ignoring mask characters and
/// separators.
pub fn last_four_digits(masked: &str) -> Option<String> {
    let digits: Vec<char> = masked.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}

/// Input for registering a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCard {
    pub account_id: Option<i64>,
    pub masked_number: String,
    pub name: String,
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_four_ignores_mask_characters() {
        assert_eq!(last_four_digits("4111 XXXX XXXX 3278").as_deref(), Some("3278"));
        assert_eq!(last_four_digits("****-3278").as_deref(), Some("3278"));
    }

    #[test]
    fn last_four_requires_four_digits() {
        assert_eq!(last_four_digits("XXXX-327"), None);
    }
}
