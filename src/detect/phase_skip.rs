//! Event-driven phase-skip detection.
//!
//! Wait events carry the wait that just ended; the concurrent cycle length
//! comes from the nearest cycle-length event. A wait longer than the cycle
//! multiplier times the cycle length, outside preemption, is a skip.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::detect::category::EvaluationWindow;
use crate::detect::DetectError;
use crate::model::{
    AlertCandidate, AlertKey, Category, DailyObservation, DeviceId, MetricSeries, PhaseSkipEvent,
};

/// Phase wait for phase `eventid - 611`; parameter is the wait in seconds.
pub const PHASE_WAIT_EVENTS: RangeInclusive<i32> = 612..=627;
/// Parameter is the cycle length in seconds; 0 means free operation.
pub const CYCLE_LENGTH_EVENT: i32 = 132;
pub const PREEMPTION_ON_EVENT: i32 = 102;
pub const PREEMPTION_OFF_EVENT: i32 = 104;

const PHASE_WAIT_BASE: i32 = 611;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseWait {
    pub device_id: DeviceId,
    pub phase: u16,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub wait_seconds: f64,
    pub cycle_length: f64,
    pub preempted: bool,
}

impl PhaseWait {
    pub fn day(&self) -> NaiveDate {
        self.ended_at.date()
    }

    pub fn is_skip(&self, cycle_multiplier: f64) -> bool {
        !self.preempted
            && self.cycle_length > 0.0
            && self.wait_seconds > cycle_multiplier * self.cycle_length
    }
}

/// Waits retained across runs so skips aggregate over several days.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseWaitHistory {
    waits: Vec<PhaseWait>,
}

impl PhaseWaitHistory {
    /// Sorted by (device, phase, end), one wait per triple.
    pub fn new(mut waits: Vec<PhaseWait>) -> Self {
        waits.sort_by(|a, b| {
            (&a.device_id, a.phase, a.ended_at).cmp(&(&b.device_id, b.phase, b.ended_at))
        });
        waits.dedup_by(|later, earlier| {
            later.device_id == earlier.device_id
                && later.phase == earlier.phase
                && later.ended_at == earlier.ended_at
        });
        Self { waits }
    }

    pub fn waits(&self) -> &[PhaseWait] {
        &self.waits
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// New history with `fresh` added. Fresh waits replace retained ones
    /// with the same (device, phase, end).
    pub fn merged(&self, fresh: Vec<PhaseWait>) -> Self {
        let mut waits = fresh;
        waits.extend(self.waits.iter().cloned());
        Self::new(waits)
    }

    /// Keep the `retention_days` days ending on `evaluation_date`.
    pub fn pruned(mut self, evaluation_date: NaiveDate, retention_days: i64) -> Self {
        let oldest = Duration::try_days(retention_days.max(1) - 1)
            .and_then(|span| evaluation_date.checked_sub_signed(span))
            .unwrap_or(NaiveDate::MIN);
        self.waits.retain(|w| w.day() >= oldest);
        self
    }
}

#[derive(Debug, Default)]
pub struct WaitDerivation {
    pub waits: Vec<PhaseWait>,
    /// Intervals that could not be paired; each one was skipped.
    pub malformed: Vec<DetectError>,
}

struct PreemptionInterval {
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
}

impl PreemptionInterval {
    fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start <= end && self.end.map_or(true, |e| e >= start)
    }
}

fn malformed(event: &PhaseSkipEvent, reason: impl Into<String>) -> DetectError {
    DetectError::MalformedEventPair {
        device_id: event.device_id.clone(),
        event_id: event.event_id,
        reason: reason.into(),
    }
}

/// Reconstruct waits from raw events, one device at a time.
pub fn derive_phase_waits(events: &[PhaseSkipEvent]) -> WaitDerivation {
    let mut by_device: BTreeMap<&DeviceId, Vec<&PhaseSkipEvent>> = BTreeMap::new();
    for event in events {
        by_device.entry(&event.device_id).or_default().push(event);
    }

    let mut derivation = WaitDerivation::default();
    for (device_id, mut device_events) in by_device {
        device_events.sort_by_key(|e| e.timestamp);
        derive_device(device_id, &device_events, &mut derivation);
    }
    derivation
}

fn derive_device(device_id: &DeviceId, events: &[&PhaseSkipEvent], out: &mut WaitDerivation) {
    let cycles: Vec<(NaiveDateTime, f64)> = events
        .iter()
        .filter(|e| e.event_id == CYCLE_LENGTH_EVENT)
        .map(|e| (e.timestamp, e.parameter as f64))
        .collect();

    let mut preemptions = Vec::new();
    let mut open: Option<NaiveDateTime> = None;
    for event in events {
        match event.event_id {
            PREEMPTION_ON_EVENT => {
                open.get_or_insert(event.timestamp);
            }
            PREEMPTION_OFF_EVENT => match open.take() {
                Some(start) => preemptions.push(PreemptionInterval {
                    start,
                    end: Some(event.timestamp),
                }),
                None => out
                    .malformed
                    .push(malformed(event, "preemption off without preemption on")),
            },
            _ => {}
        }
    }
    if let Some(start) = open {
        preemptions.push(PreemptionInterval { start, end: None });
    }

    for event in events.iter().filter(|e| PHASE_WAIT_EVENTS.contains(&e.event_id)) {
        if event.parameter < 0 {
            out.malformed.push(malformed(event, "negative wait duration"));
            continue;
        }
        let Some(cycle_length) = cycle_length_at(&cycles, event.timestamp) else {
            out.malformed.push(malformed(event, "no cycle length for wait"));
            continue;
        };

        let ended_at = event.timestamp;
        let Some(started_at) = Duration::try_seconds(event.parameter)
            .and_then(|wait| ended_at.checked_sub_signed(wait))
        else {
            out.malformed.push(malformed(event, "wait duration out of range"));
            continue;
        };
        let preempted = preemptions.iter().any(|p| p.overlaps(started_at, ended_at));

        out.waits.push(PhaseWait {
            device_id: device_id.clone(),
            phase: (event.event_id - PHASE_WAIT_BASE) as u16,
            started_at,
            ended_at,
            wait_seconds: event.parameter as f64,
            cycle_length,
            preempted,
        });
    }
}

/// Latest cycle length at or before `at`, else the first one after it.
fn cycle_length_at(cycles: &[(NaiveDateTime, f64)], at: NaiveDateTime) -> Option<f64> {
    let split = cycles.partition_point(|(ts, _)| *ts <= at);
    if split > 0 {
        Some(cycles[split - 1].1)
    } else {
        cycles.first().map(|(_, len)| *len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSkipPolicy {
    pub cycle_multiplier: f64,
    pub alert_threshold: u32,
    pub retention_days: i64,
}

#[derive(Default)]
struct SkipDay {
    skips: u32,
    waits: u32,
    max_wait: f64,
    max_cycle: f64,
}

/// Daily skip counts per (device, phase); volume is the number of waits seen.
pub fn skip_series(policy: &PhaseSkipPolicy, history: &PhaseWaitHistory) -> MetricSeries {
    let mut series = MetricSeries::new();
    for wait in history.waits() {
        let key = AlertKey::phase(&wait.device_id, wait.phase);
        let skip = if wait.is_skip(policy.cycle_multiplier) { 1.0 } else { 0.0 };
        let current = series
            .get(&key, wait.day())
            .copied()
            .unwrap_or(DailyObservation::new(0.0, 0.0));
        series.insert(
            key,
            wait.day(),
            DailyObservation::new(current.value + skip, current.volume + 1.0),
        );
    }
    series
}

/// Candidates per (device, phase, day) inside the evaluation window.
pub fn evaluate_phase_skips(
    policy: &PhaseSkipPolicy,
    history: &PhaseWaitHistory,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let span = window.span();
    let mut days: BTreeMap<(AlertKey, NaiveDate), SkipDay> = BTreeMap::new();

    for wait in history.waits().iter().filter(|w| span.contains(w.day())) {
        let entry = days
            .entry((AlertKey::phase(&wait.device_id, wait.phase), wait.day()))
            .or_default();
        entry.waits += 1;
        if wait.is_skip(policy.cycle_multiplier) {
            entry.skips += 1;
            entry.max_wait = entry.max_wait.max(wait.wait_seconds);
            entry.max_cycle = entry.max_cycle.max(wait.cycle_length);
        }
    }

    let candidates: Vec<AlertCandidate> = days
        .into_iter()
        .filter(|(_, d)| d.skips >= policy.alert_threshold)
        .map(|((key, day), d)| {
            AlertCandidate::new(Category::PhaseSkip, key, day, d.skips as f64).with_evidence(json!({
                "total_skips": d.skips,
                "waits_observed": d.waits,
                "max_wait_seconds": d.max_wait,
                "cycle_length": d.max_cycle,
            }))
        })
        .collect();

    debug!(
        waits = history.len(),
        candidates = candidates.len(),
        "phase skip evaluation finished"
    );
    candidates
}
