use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use spendy_core::{CardId, MatchSettings, Money, TransactionId};
use std::cmp::Ordering;

use crate::util::{levenshtein_ratio, token_overlap};

/// An incoming observation, already in its card's currency.
#[derive(Debug, Clone)]
pub struct MatchableObservation {
    pub card_id: CardId,
    pub amount: Money,
    pub currency: String,
    pub datetimes: Vec<DateTime<Utc>>,
    pub merchant_norm: String,
    pub fingerprint: String,
}

/// An existing canonical transaction the observation may belong to.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub transaction_id: TransactionId,
    pub card_id: CardId,
    pub amount: Money,
    pub currency: String,
    pub datetimes: Vec<DateTime<Utc>>,
    pub merchant_norm: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Fingerprint,
    SameDay,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMatch {
    pub transaction_id: TransactionId,
    pub match_type: MatchType,
    pub confidence: f64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MatchDecision {
    NewTransaction,
    LinkTo {
        transaction_id: TransactionId,
        confidence: f64,
    },
    Ambiguous { candidates: Vec<ScoredMatch> },
}

pub struct AutoMatchEngine {
    pub window: Duration,
    pub auto_link_threshold: f64,
    pub ambiguous_threshold: f64,
    pub datetime_weight: f64,
    pub description_weight: f64,
}

impl Default for AutoMatchEngine {
    fn default() -> Self {
        Self::from_settings(&MatchSettings::default())
    }
}

impl AutoMatchEngine {
    pub fn from_settings(settings: &MatchSettings) -> Self {
        Self {
            window: settings.window(),
            auto_link_threshold: settings.auto_link_threshold,
            ambiguous_threshold: settings.ambiguous_threshold,
            datetime_weight: settings.datetime_weight,
            description_weight: settings.description_weight,
        }
    }

    /// Scores every candidate that clears the hard gate and the time window,
    /// best first. Ties go to the newest transaction, then the higher id.
    pub fn find_matches(
        &self,
        incoming: &MatchableObservation,
        candidates: &[MatchCandidate],
    ) -> Vec<ScoredMatch> {
        let mut scored: Vec<ScoredMatch> = candidates
            .iter()
            .filter_map(|c| self.score_pair(incoming, c))
            .collect();
        scored.sort_by(rank_order);
        scored
    }

    pub fn decide(&self, ranked: &[ScoredMatch]) -> MatchDecision {
        let Some(best) = ranked.first() else {
            return MatchDecision::NewTransaction;
        };
        if best.confidence >= self.auto_link_threshold {
            MatchDecision::LinkTo {
                transaction_id: best.transaction_id,
                confidence: best.confidence,
            }
        } else if best.confidence >= self.ambiguous_threshold {
            MatchDecision::Ambiguous {
                candidates: ranked
                    .iter()
                    .filter(|m| m.confidence >= self.ambiguous_threshold)
                    .cloned()
                    .collect(),
            }
        } else {
            MatchDecision::NewTransaction
        }
    }

    /// `None` when the pair fails the amount/currency gate or falls outside
    /// the window.
    pub fn score_pair(
        &self,
        inc: &MatchableObservation,
        cand: &MatchCandidate,
    ) -> Option<ScoredMatch> {
        if inc.card_id != cand.card_id
            || inc.amount != cand.amount
            || inc.currency != cand.currency
        {
            return None;
        }

        if !inc.fingerprint.is_empty() && inc.fingerprint == cand.fingerprint {
            return Some(ScoredMatch {
                transaction_id: cand.transaction_id,
                match_type: MatchType::Fingerprint,
                confidence: 1.0,
                created_at: cand.created_at,
            });
        }

        let (dt_score, same_day) = match closest_gap(&inc.datetimes, &cand.datetimes) {
            None => (0.5, false),
            Some((_, true)) => (1.0, true),
            Some((gap, _)) if gap > self.window => return None,
            Some((gap, _)) => {
                let window = self.window.num_seconds().max(1) as f64;
                (1.0 - gap.num_seconds() as f64 / window, false)
            }
        };
        let desc_score = description_similarity(&inc.merchant_norm, &cand.merchant_norm);
        let total = self.datetime_weight + self.description_weight;
        let weighted = if total > 0.0 {
            (self.datetime_weight * dt_score + self.description_weight * desc_score) / total
        } else {
            0.0
        };
        let confidence = weighted.clamp(0.0, 1.0);

        Some(ScoredMatch {
            transaction_id: cand.transaction_id,
            match_type: if same_day { MatchType::SameDay } else { MatchType::Fuzzy },
            confidence,
            created_at: cand.created_at,
        })
    }
}

fn rank_order(a: &ScoredMatch, b: &ScoredMatch) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.transaction_id.cmp(&a.transaction_id))
}

/// Smallest gap between any two datetimes, and whether any pair shares a
/// calendar day. `None` when either side has no datetime.
fn closest_gap(a: &[DateTime<Utc>], b: &[DateTime<Utc>]) -> Option<(Duration, bool)> {
    let mut best: Option<Duration> = None;
    let mut same_day = false;
    for x in a {
        for y in b {
            let gap = (*x - *y).abs();
            best = Some(best.map_or(gap, |g| g.min(gap)));
            same_day |= x.date_naive() == y.date_naive();
        }
    }
    best.map(|g| (g, same_day))
}

/// Similarity of two normalised merchant strings in [0.0, 1.0]: the better
/// of edit-distance ratio and token overlap. Unknown merchants score 0.5.
pub fn description_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.5;
    }
    if a == b {
        return 1.0;
    }
    levenshtein_ratio(a, b).max(token_overlap(a, b))
}
