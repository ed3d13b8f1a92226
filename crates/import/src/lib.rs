macro_rules! re {
    ($pat:expr) => {{
        static RE: ::std::sync::OnceLock<::regex::Regex> = ::std::sync::OnceLock::new();
        RE.get_or_init(|| ::regex::Regex::new($pat).expect("valid regex"))
    }};
}

pub mod canonical;
pub mod fingerprint;
pub mod manual;
pub mod match_engine;
pub mod normalize;
pub mod parser;
pub mod sms;
pub mod statement;
pub(crate) mod util;

pub use canonical::{Canonicalizer, ManualEdits, Observation, Resolution};
pub use fingerprint::{fingerprint, fingerprint_key, FingerprintInput};
pub use match_engine::{
    AutoMatchEngine, MatchCandidate, MatchDecision, MatchType, MatchableObservation, ScoredMatch,
};
pub use normalize::normalize;
pub use parser::{ParseFailure, ParseOutcome, ParseStrategy, Parser};
