//! Field-by-field resolution of a transaction from its linked observations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use spendy_core::{
    CanonicalField, CanonicalFields, Money, PriorityPolicy, SourceEventId, SourceType,
    TransactionKind,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// What one linked source contributes, already converted to the card
/// currency where a rate was known.
#[derive(Debug, Clone)]
pub struct Observation {
    pub source_event_id: SourceEventId,
    pub source_type: SourceType,
    pub is_primary: bool,
    pub confidence: Option<f64>,
    pub contributed_at: DateTime<Utc>,
    pub amount: Option<Money>,
    pub currency: Option<String>,
    pub original_amount: Option<Money>,
    pub original_currency: Option<String>,
    pub fx_rate: Option<Decimal>,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub posting_datetime: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub kind: Option<TransactionKind>,
}

/// Fields pinned by hand and when that happened.
#[derive(Debug, Clone, Default)]
pub struct ManualEdits {
    pub fields: BTreeSet<CanonicalField>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub fields: CanonicalFields,
    /// Manual edits still in force after resolution.
    pub edited_fields: BTreeSet<CanonicalField>,
    pub edited_at: Option<DateTime<Utc>>,
    /// Which source won each field; absent when the field kept its
    /// current or manual value.
    pub winners: BTreeMap<CanonicalField, SourceEventId>,
}

pub struct Canonicalizer {
    policy: PriorityPolicy,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(PriorityPolicy::default())
    }
}

impl Canonicalizer {
    pub fn new(policy: PriorityPolicy) -> Self {
        Self { policy }
    }

    pub fn resolve(
        &self,
        current: &CanonicalFields,
        observations: &[Observation],
        edits: &ManualEdits,
    ) -> Resolution {
        let newest = observations.iter().map(|o| o.contributed_at).max();
        let keep_edits = match (edits.edited_at, newest) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(edited), Some(newest)) => edited >= newest,
        };
        let pinned = |f: CanonicalField| keep_edits && edits.fields.contains(&f);

        let mut fields = current.clone();
        let mut winners = BTreeMap::new();

        if !pinned(CanonicalField::Amount) {
            let winner = self
                .ordered(CanonicalField::Amount, observations)
                .into_iter()
                .find(|o| o.amount.is_some_and(|a| !a.is_zero()) && o.currency.is_some());
            if let Some(o) = winner {
                if let (Some(amount), Some(currency)) = (o.amount, &o.currency) {
                    fields.amount = amount;
                    fields.currency = currency.clone();
                    fields.original_amount = o.original_amount;
                    fields.original_currency = o.original_currency.clone();
                    fields.fx_rate = o.fx_rate;
                    winners.insert(CanonicalField::Amount, o.source_event_id);
                }
            }
        }

        if !pinned(CanonicalField::TransactionDatetime) {
            if let Some((id, dt)) =
                self.first(CanonicalField::TransactionDatetime, observations, |o| o.transaction_datetime)
            {
                fields.transaction_datetime = Some(dt);
                winners.insert(CanonicalField::TransactionDatetime, id);
            }
        }

        if !pinned(CanonicalField::PostingDatetime) {
            if let Some((id, dt)) =
                self.first(CanonicalField::PostingDatetime, observations, |o| o.posting_datetime)
            {
                fields.posting_datetime = Some(dt);
                winners.insert(CanonicalField::PostingDatetime, id);
            }
        }

        if !pinned(CanonicalField::Description) {
            if let Some((id, d)) = self.first(CanonicalField::Description, observations, |o| {
                o.description.clone().filter(|d| !d.trim().is_empty())
            }) {
                fields.description = d;
                winners.insert(CanonicalField::Description, id);
            }
        }

        if !pinned(CanonicalField::Location) {
            if let Some((id, l)) = self.first(CanonicalField::Location, observations, |o| {
                o.location.clone().filter(|l| !l.trim().is_empty())
            }) {
                fields.location = Some(l);
                winners.insert(CanonicalField::Location, id);
            }
        }

        if !pinned(CanonicalField::Kind) {
            let specific = self.first(CanonicalField::Kind, observations, |o| {
                o.kind.filter(|k| *k != TransactionKind::Other)
            });
            let any = || self.first(CanonicalField::Kind, observations, |o| o.kind);
            if let Some((id, kind)) = specific.or_else(any) {
                fields.kind = kind;
                winners.insert(CanonicalField::Kind, id);
            }
        }

        let (edited_fields, edited_at) = if keep_edits {
            (edits.fields.clone(), edits.edited_at)
        } else {
            (BTreeSet::new(), None)
        };

        Resolution {
            fields,
            edited_fields,
            edited_at,
            winners,
        }
    }

    /// Observations in preference order for `field`: policy rank, primary
    /// link, match confidence, then earliest contribution.
    fn ordered<'a>(&self, field: CanonicalField, observations: &'a [Observation]) -> Vec<&'a Observation> {
        let mut sorted: Vec<&Observation> = observations.iter().collect();
        sorted.sort_by(|a, b| {
            self.policy
                .rank(field, a.source_type)
                .cmp(&self.policy.rank(field, b.source_type))
                .then_with(|| b.is_primary.cmp(&a.is_primary))
                .then_with(|| {
                    let conf = |o: &Observation| o.confidence.unwrap_or(f64::NEG_INFINITY);
                    conf(b).partial_cmp(&conf(a)).unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.contributed_at.cmp(&b.contributed_at))
                .then_with(|| a.source_event_id.cmp(&b.source_event_id))
        });
        sorted
    }

    fn first<T>(
        &self,
        field: CanonicalField,
        observations: &[Observation],
        value: impl Fn(&Observation) -> Option<T>,
    ) -> Option<(SourceEventId, T)> {
        self.ordered(field, observations)
            .into_iter()
            .find_map(|o| value(o).map(|v| (o.source_event_id, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap()
    }

    fn observation(id: i64, source_type: SourceType, minor: i64, desc: &str) -> Observation {
        Observation {
            source_event_id: SourceEventId(id),
            source_type,
            is_primary: false,
            confidence: Some(0.9),
            contributed_at: at(10),
            amount: Some(Money::from_minor(minor)),
            currency: Some("AED".into()),
            original_amount: None,
            original_currency: None,
            fx_rate: None,
            transaction_datetime: None,
            posting_datetime: None,
            description: Some(desc.into()),
            location: None,
            kind: None,
        }
    }

    fn current() -> CanonicalFields {
        CanonicalFields {
            amount: Money::from_minor(-1),
            currency: "AED".into(),
            original_amount: None,
            original_currency: None,
            fx_rate: None,
            transaction_datetime: None,
            posting_datetime: None,
            description: "old".into(),
            location: Some("Dubai".into()),
            kind: TransactionKind::Other,
        }
    }

    #[test]
    fn statement_amount_beats_message() {
        let mut sms = observation(1, SourceType::SmsText, -9950, "CARREFOUR");
        sms.is_primary = true;
        sms.transaction_datetime = Some(at(9));
        let mut pdf = observation(2, SourceType::PdfStatement, -10000, "CARREFOUR HYPERMARKET");
        pdf.transaction_datetime = Some(at(0));
        pdf.posting_datetime = Some(at(0));

        let r = Canonicalizer::default().resolve(&current(), &[sms, pdf], &ManualEdits::default());
        assert_eq!(r.fields.amount, Money::from_minor(-10000));
        assert_eq!(r.fields.description, "CARREFOUR HYPERMARKET");
        // message time wins over the statement's date-only value
        assert_eq!(r.fields.transaction_datetime, Some(at(9)));
        assert_eq!(r.fields.posting_datetime, Some(at(0)));
        assert_eq!(r.winners[&CanonicalField::Amount], SourceEventId(2));
    }

    #[test]
    fn amount_group_moves_together() {
        let mut sms = observation(1, SourceType::SmsText, -3673, "SHOP");
        sms.original_amount = Some(Money::from_minor(-1000));
        sms.original_currency = Some("USD".into());
        sms.fx_rate = Some(Decimal::new(36725, 4));
        let r = Canonicalizer::default().resolve(&current(), &[sms], &ManualEdits::default());
        assert_eq!(r.fields.amount, Money::from_minor(-3673));
        assert_eq!(r.fields.original_currency.as_deref(), Some("USD"));
        assert_eq!(r.fields.fx_rate, Some(Decimal::new(36725, 4)));
    }

    #[test]
    fn injected_policy_changes_winner() {
        let policy = PriorityPolicy::default()
            .with_order(CanonicalField::Amount, vec![SourceType::SmsText, SourceType::PdfStatement]);
        let sms = observation(1, SourceType::SmsText, -9950, "A");
        let pdf = observation(2, SourceType::PdfStatement, -10000, "B");
        let r = Canonicalizer::new(policy).resolve(&current(), &[sms, pdf], &ManualEdits::default());
        assert_eq!(r.fields.amount, Money::from_minor(-9950));
    }

    #[test]
    fn same_type_prefers_primary_then_confidence() {
        let mut a = observation(1, SourceType::SmsText, -100, "FIRST");
        a.confidence = Some(0.95);
        let mut b = observation(2, SourceType::SmsText, -100, "PRIMARY");
        b.is_primary = true;
        b.confidence = Some(0.6);
        let c = observation(3, SourceType::SmsText, -100, "LOW");
        let r = Canonicalizer::default().resolve(&current(), &[a.clone(), b, c.clone()], &ManualEdits::default());
        assert_eq!(r.fields.description, "PRIMARY");

        let r = Canonicalizer::default().resolve(&current(), &[a, c], &ManualEdits::default());
        assert_eq!(r.fields.description, "FIRST");
    }

    #[test]
    fn kind_prefers_specific_over_other() {
        let mut sms = observation(1, SourceType::SmsText, -100, "X");
        sms.kind = Some(TransactionKind::Other);
        let mut pdf = observation(2, SourceType::PdfStatement, -100, "X");
        pdf.kind = Some(TransactionKind::Purchase);
        let r = Canonicalizer::default().resolve(&current(), &[sms.clone(), pdf], &ManualEdits::default());
        assert_eq!(r.fields.kind, TransactionKind::Purchase);

        let r = Canonicalizer::default().resolve(&current(), &[sms], &ManualEdits::default());
        assert_eq!(r.fields.kind, TransactionKind::Other);
    }

    #[test]
    fn missing_values_keep_current() {
        let mut sms = observation(1, SourceType::SmsText, -100, "   ");
        sms.location = None;
        let r = Canonicalizer::default().resolve(&current(), &[sms], &ManualEdits::default());
        assert_eq!(r.fields.description, "old");
        assert_eq!(r.fields.location.as_deref(), Some("Dubai"));
        assert!(!r.winners.contains_key(&CanonicalField::Description));
    }

    #[test]
    fn fresh_manual_edit_is_kept() {
        let mut cur = current();
        cur.description = "My groceries".into();
        let edits = ManualEdits {
            fields: [CanonicalField::Description].into_iter().collect(),
            edited_at: Some(at(12)),
        };
        let sms = observation(1, SourceType::SmsText, -100, "CARREFOUR");
        let r = Canonicalizer::default().resolve(&cur, &[sms], &edits);
        assert_eq!(r.fields.description, "My groceries");
        assert_eq!(r.fields.amount, Money::from_minor(-100));
        assert_eq!(r.edited_at, Some(at(12)));
    }

    #[test]
    fn stale_manual_edit_is_dropped() {
        let mut cur = current();
        cur.description = "My groceries".into();
        let edits = ManualEdits {
            fields: [CanonicalField::Description].into_iter().collect(),
            edited_at: Some(at(8)),
        };
        let sms = observation(1, SourceType::SmsText, -100, "CARREFOUR");
        let r = Canonicalizer::default().resolve(&cur, &[sms], &edits);
        assert_eq!(r.fields.description, "CARREFOUR");
        assert!(r.edited_fields.is_empty());
        assert_eq!(r.edited_at, None);
    }

    #[test]
    fn resolution_is_stable() {
        let sms = observation(1, SourceType::SmsText, -100, "CARREFOUR");
        let pdf = observation(2, SourceType::PdfStatement, -100, "CARREFOUR CC");
        let c = Canonicalizer::default();
        let first = c.resolve(&current(), &[sms.clone(), pdf.clone()], &ManualEdits::default());
        let second = c.resolve(&first.fields, &[pdf, sms], &ManualEdits::default());
        assert_eq!(first.fields, second.fields);
    }
}
