//! Verdict computation
//!
//! [`Aggregator`] collects module results for a message, [`apply_groups`]
//! rescales grouped modules and [`decide`] turns the weighted results into
//! one action.

mod aggregator;
mod weighting;

pub use aggregator::Aggregator;
pub(crate) use aggregator::panic_message;
pub use weighting::apply_groups;

use crate::modules::MessageCheckResult;
use mailsift_common::config::ScoringConfig;
use mailsift_common::Action;

/// Reply text when a module check failed
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred";

const DEFAULT_REJECT_MESSAGE: &str = "Message rejected";
const DEFAULT_TEMPFAIL_MESSAGE: &str = "Message deferred, try again later";

/// Final disposition of a message
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: Action,
    /// Reply text for TempFail and Reject; empty for Permit
    pub message: String,
    pub reject_score: f64,
    pub reject_threshold: f64,
    pub tempfail_score: f64,
    pub tempfail_threshold: f64,
    /// Module whose result supplied `message`
    pub deciding_module: Option<String>,
    /// Whether collection stopped early on the breaker threshold
    pub breaker_tripped: bool,
    /// Every collected result, in module registration order
    pub results: Vec<MessageCheckResult>,
}

impl Verdict {
    /// Permit without any module results
    pub fn permit(reject_threshold: f64, tempfail_threshold: f64) -> Self {
        Self {
            action: Action::Permit,
            message: String::new(),
            reject_score: 0.0,
            reject_threshold,
            tempfail_score: 0.0,
            tempfail_threshold,
            deciding_module: None,
            breaker_tripped: false,
            results: Vec::new(),
        }
    }

    /// Results that landed in one action bucket
    pub fn bucket(&self, action: Action) -> impl Iterator<Item = &MessageCheckResult> {
        self.results.iter().filter(move |r| r.action == action)
    }

    pub fn error_count(&self) -> usize {
        self.bucket(Action::Error).count()
    }
}

fn bucket_score(results: &[MessageCheckResult], action: Action) -> f64 {
    results
        .iter()
        .filter(|r| r.action == action)
        .map(|r| r.weighted_score)
        .sum()
}

/// Highest weighted result with a reply text; ties keep the first
fn deciding_result(results: &[MessageCheckResult], action: Action) -> Option<&MessageCheckResult> {
    results
        .iter()
        .filter(|r| r.action == action && !r.message.is_empty())
        .fold(None, |best: Option<&MessageCheckResult>, r| match best {
            Some(b) if b.weighted_score >= r.weighted_score => Some(b),
            _ => Some(r),
        })
}

/// Decide the action for weighted results.
///
/// Precedence: reject score over the reject threshold, then any module
/// error, then reject plus tempfail score over the tempfail threshold.
/// A threshold of zero or less disables its comparison.
pub fn decide(results: Vec<MessageCheckResult>, scoring: &ScoringConfig) -> Verdict {
    let reject_score = bucket_score(&results, Action::Reject);
    let tempfail_score = bucket_score(&results, Action::TempFail);
    let reject_threshold = scoring.reject_threshold;
    let tempfail_threshold = scoring.tempfail_threshold;

    let mut verdict = Verdict {
        reject_score,
        tempfail_score,
        ..Verdict::permit(reject_threshold, tempfail_threshold)
    };

    if reject_threshold > 0.0 && reject_score >= reject_threshold {
        verdict.action = Action::Reject;
        let deciding = deciding_result(&results, Action::Reject);
        verdict.message = deciding
            .map(|r| r.message.clone())
            .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string());
        verdict.deciding_module = deciding.map(|r| r.module.clone());
    } else if let Some(failed) = results.iter().find(|r| r.action == Action::Error) {
        verdict.action = Action::TempFail;
        verdict.message = INTERNAL_ERROR_MESSAGE.to_string();
        verdict.deciding_module = Some(failed.module.clone());
    } else if tempfail_threshold > 0.0 && tempfail_score + reject_score >= tempfail_threshold {
        verdict.action = Action::TempFail;
        let deciding = deciding_result(&results, Action::TempFail)
            .or_else(|| deciding_result(&results, Action::Reject));
        verdict.message = deciding
            .map(|r| r.message.clone())
            .unwrap_or_else(|| DEFAULT_TEMPFAIL_MESSAGE.to_string());
        verdict.deciding_module = deciding.map(|r| r.module.clone());
    }

    verdict.results = results;
    verdict
}
