//! Alert lifecycle: recency filter, suppression, history upsert, retention.
//!
//! Value in, value out. The caller's history is never mutated; a new table is
//! returned alongside the alerts to report.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{AlertCandidate, PastAlerts};

/// Whether a suppressed candidate moves the stored last-alert date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionClock {
    /// The window runs from the last reported alert. Suppressed candidates
    /// leave history untouched, so an unresolved issue resurfaces once the
    /// window has elapsed.
    #[default]
    Fixed,
    /// Suppressed candidates still advance the stored date, so an issue that
    /// keeps firing stays quiet until it has been clear for a full window.
    Sliding,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecyclePolicy {
    pub flagging_days: i64,
    pub suppression_days: i64,
    pub retention_days: i64,
    pub suppress_repeated: bool,
    pub clock: SuppressionClock,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            flagging_days: 7,
            suppression_days: 21,
            retention_days: 104 * 7,
            suppress_repeated: true,
            clock: SuppressionClock::Fixed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleOutcome {
    pub to_report: Vec<AlertCandidate>,
    pub history: PastAlerts,
    pub suppressed: usize,
    /// Candidates dropped by the recency filter.
    pub stale: usize,
}

/// Filter one category's candidates against its past alerts.
///
/// Suppression always compares against `history` as supplied, so the
/// decision for one candidate never depends on another candidate of the
/// same run.
pub fn apply(
    policy: &LifecyclePolicy,
    evaluation_date: NaiveDate,
    mut candidates: Vec<AlertCandidate>,
    history: &PastAlerts,
) -> LifecycleOutcome {
    candidates.sort_by(|a, b| (&a.key, a.day).cmp(&(&b.key, b.day)));

    let before = candidates.len();
    candidates.retain(|c| {
        let age = (evaluation_date - c.day).num_days();
        c.alert && (0..policy.flagging_days).contains(&age)
    });
    let stale = before - candidates.len();

    let mut updated = history.clone();
    let mut to_report = Vec::with_capacity(candidates.len());
    let mut suppressed = 0usize;

    for candidate in candidates {
        let recent = policy.suppress_repeated
            && history
                .last_alert(&candidate.key)
                .is_some_and(|last| (candidate.day - last).num_days() < policy.suppression_days);

        if recent {
            suppressed += 1;
            debug!(
                category = %candidate.category,
                key = %candidate.key,
                day = %candidate.day,
                "suppressed repeat alert"
            );
            if policy.clock == SuppressionClock::Sliding {
                updated.upsert(candidate.key.clone(), candidate.day);
            }
            continue;
        }

        updated.upsert(candidate.key.clone(), candidate.day);
        to_report.push(candidate);
    }

    let cutoff = Duration::try_days(policy.retention_days.max(0))
        .and_then(|keep| evaluation_date.checked_sub_signed(keep))
        .unwrap_or(NaiveDate::MIN);
    let before_prune = updated.len();
    updated.retain_since(cutoff);
    if updated.len() < before_prune {
        debug!(pruned = before_prune - updated.len(), cutoff = %cutoff, "pruned alert history");
    }

    LifecycleOutcome {
        to_report,
        history: updated,
        suppressed,
        stale,
    }
}
