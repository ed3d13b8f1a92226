use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::card::CardId;
use crate::money::Money;
use crate::transaction::TransactionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceEventId(pub i64);

impl fmt::Display for SourceEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel a raw observation arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    TelegramText,
    SmsText,
    SmsScreenshot,
    BankScreenshot,
    PdfStatement,
    Manual,
}

impl SourceType {
    pub const ALL: [SourceType; 6] = [
        SourceType::TelegramText,
        SourceType::SmsText,
        SourceType::SmsScreenshot,
        SourceType::BankScreenshot,
        SourceType::PdfStatement,
        SourceType::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::TelegramText => "telegram_text",
            SourceType::SmsText => "sms_text",
            SourceType::SmsScreenshot => "sms_screenshot",
            SourceType::BankScreenshot => "bank_screenshot",
            SourceType::PdfStatement => "pdf_statement",
            SourceType::Manual => "manual",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown source type: '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    New,
    Parsed,
    Failed,
    /// Recognised as a non-transaction message (reminder, statement summary).
    Skipped,
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseStatus::New => write!(f, "new"),
            ParseStatus::Parsed => write!(f, "parsed"),
            ParseStatus::Failed => write!(f, "failed"),
            ParseStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ParseStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ParseStatus::New),
            "parsed" => Ok(ParseStatus::Parsed),
            "failed" => Ok(ParseStatus::Failed),
            "skipped" => Ok(ParseStatus::Skipped),
            other => Err(format!("Unknown parse status: '{other}'")),
        }
    }
}

/// Best-effort fields extracted from a raw payload. Anything the parser
/// could not find stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFields {
    pub amount: Option<Money>,
    pub currency: Option<String>,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub posting_datetime: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub card_last4: Option<String>,
    pub kind: Option<TransactionKind>,
    pub location: Option<String>,
}

impl ParsedFields {
    /// Every datetime the observation carries, transaction time first.
    pub fn datetimes(&self) -> Vec<DateTime<Utc>> {
        self.transaction_datetime
            .into_iter()
            .chain(self.posting_datetime)
            .collect()
    }
}

/// Caller-supplied hints that travel with a payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceContext {
    pub account_id: Option<i64>,
    pub card_id: Option<CardId>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    /// When the message was received; used as the transaction time when the
    /// payload itself carries none.
    pub received_at: Option<DateTime<Utc>>,
}

/// One raw observation of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    pub id: SourceEventId,
    pub source_type: SourceType,
    pub raw_text: Option<String>,
    pub file_path: Option<String>,
    pub raw_hash: String,
    pub parsed: ParsedFields,
    pub account_id: Option<i64>,
    /// Card given by the caller or resolved from the parsed last four digits.
    pub card_id: Option<CardId>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    pub received_at: DateTime<Utc>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub reprocess_version: i64,
    pub created_at: DateTime<Utc>,
    pub parsed_at: Option<DateTime<Utc>>,
}

impl SourceEvent {
    pub fn is_parsed(&self) -> bool {
        self.parse_status == ParseStatus::Parsed
    }

    /// Transaction time from the payload, falling back to reception time.
    pub fn effective_transaction_datetime(&self) -> DateTime<Utc> {
        self.parsed.transaction_datetime.unwrap_or(self.received_at)
    }

    /// When this event last changed what it contributes to a transaction.
    pub fn contributed_at(&self) -> DateTime<Utc> {
        self.parsed_at.unwrap_or(self.created_at)
    }
}
