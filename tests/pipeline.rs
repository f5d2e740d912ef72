//! End-to-end scenarios through the public library API.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use phasewatch::config::ReportConfig;
use phasewatch::detect::baseline::Baseline;
use phasewatch::detect::category::{evaluate_cusum_key, CusumPolicy, EvaluationWindow, Thresholds};
use phasewatch::detect::cusum::CusumDetector;
use phasewatch::detect::lifecycle::{self, LifecyclePolicy, SuppressionClock};
use phasewatch::detect::{AlertEngine, CategoryOutcome, RunInputs, RunState};
use phasewatch::ingest;
use phasewatch::model::{
    AlertKey, Category, DailyObservation, DeviceId, PastAlerts, PhaseSkipEvent, SignalInfo,
    TableInput,
};

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + Duration::days(n - 1)
}

fn s1_phase2() -> AlertKey {
    AlertKey::phase(&DeviceId::from("s1"), 2)
}

/// Days 1..=7 with max-out percentages [5,5,5,5,5,5,40], 50 services each.
fn scenario_candidates() -> Vec<phasewatch::model::AlertCandidate> {
    let days: BTreeMap<NaiveDate, DailyObservation> = [5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 40.0]
        .iter()
        .enumerate()
        .map(|(i, pct)| (day(i as i64 + 1), DailyObservation::new(pct / 100.0, 50.0)))
        .collect();
    evaluate_cusum_key(
        &CusumPolicy::max_out(Thresholds::MAX_OUT),
        &CusumDetector::default(),
        &s1_phase2(),
        &days,
        &Baseline::known(0.05, 0.01, 21),
        &EvaluationWindow::new(day(7), 7),
    )
}

fn registry() -> Vec<SignalInfo> {
    vec![
        SignalInfo { device_id: "s1".into(), name: "Main & 1st".into(), region: "North".into() },
        SignalInfo { device_id: "d1".into(), name: "Oak & 5th".into(), region: "South".into() },
    ]
}

#[test]
fn test_scenario_spike_is_reported_and_recorded() {
    let candidates = scenario_candidates();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].day, day(7));

    let out = lifecycle::apply(&LifecyclePolicy::default(), day(7), candidates, &PastAlerts::new());
    assert_eq!(out.to_report.len(), 1);
    assert_eq!(out.to_report[0].key, s1_phase2());
    assert_eq!(out.history.last_alert(&s1_phase2()), Some(day(7)));
}

#[test]
fn test_scenario_prior_alert_suppresses_under_either_clock() {
    let mut prior = PastAlerts::new();
    prior.upsert(s1_phase2(), day(1));

    let fixed = lifecycle::apply(&LifecyclePolicy::default(), day(7), scenario_candidates(), &prior);
    assert!(fixed.to_report.is_empty());
    assert_eq!(fixed.history.last_alert(&s1_phase2()), Some(day(1)));

    let sliding_policy = LifecyclePolicy {
        clock: SuppressionClock::Sliding,
        ..LifecyclePolicy::default()
    };
    let sliding = lifecycle::apply(&sliding_policy, day(7), scenario_candidates(), &prior);
    assert!(sliding.to_report.is_empty());
    assert_eq!(sliding.history.last_alert(&s1_phase2()), Some(day(7)));
}

#[test]
fn test_lifecycle_is_idempotent_on_its_own_output() {
    let policy = LifecyclePolicy::default();
    let first = lifecycle::apply(&policy, day(7), scenario_candidates(), &PastAlerts::new());
    let second = lifecycle::apply(&policy, day(7), scenario_candidates(), &first.history);
    assert!(second.to_report.is_empty());
}

fn event(device: &str, at: &str, event_id: i32, parameter: i64) -> PhaseSkipEvent {
    PhaseSkipEvent {
        device_id: DeviceId::from(device),
        timestamp: ingest::parse_timestamp(at).unwrap(),
        event_id,
        parameter,
    }
}

#[test]
fn test_phase_skip_waits_carry_across_runs() {
    let engine = AlertEngine::new(ReportConfig::default()).unwrap();
    let first_day = RunInputs {
        signals: registry(),
        phase_skip_events: vec![
            event("d1", "2024-03-10 14:22:30", 612, 200),
            event("d1", "2024-03-10 14:22:35", 132, 120),
        ]
        .into(),
        ..RunInputs::default()
    };
    let first = engine.run(&first_day, &RunState::default(), day(10)).unwrap();
    assert_eq!(first.alerts(Category::PhaseSkip).len(), 1);
    assert_eq!(first.alerts(Category::PhaseSkip)[0].region.as_deref(), Some("South"));
    assert_eq!(first.phase_waits.len(), 1);

    // next day: no new events, retained wait is still there, alert suppressed
    let next_day = RunInputs { signals: registry(), ..RunInputs::default() };
    let second = engine.run(&next_day, &first.into_state(), day(11)).unwrap();
    assert_eq!(second.phase_waits.len(), 1);
    assert_eq!(second.total_alerts(), 0);

    // past the retention horizon the wait is gone
    let later = engine.run(&next_day, &second.into_state(), day(30)).unwrap();
    assert!(later.phase_waits.is_empty());
}

#[test]
fn test_preempted_wait_never_alerts() {
    let engine = AlertEngine::new(ReportConfig::default()).unwrap();
    let inputs = RunInputs {
        signals: registry(),
        phase_skip_events: vec![
            event("d1", "2024-03-10 08:00:00", 132, 100),
            event("d1", "2024-03-10 08:01:00", 102, 1),
            event("d1", "2024-03-10 08:02:00", 104, 1),
            event("d1", "2024-03-10 08:04:00", 613, 200),
        ]
        .into(),
        ..RunInputs::default()
    };
    let outcome = engine.run(&inputs, &RunState::default(), day(10)).unwrap();
    assert!(outcome.alerts(Category::PhaseSkip).is_empty());
    assert!(outcome.phase_waits.waits()[0].preempted);
}

#[test]
fn test_malformed_events_do_not_disturb_other_categories() {
    let engine = AlertEngine::new(ReportConfig::default()).unwrap();
    let inputs = RunInputs {
        signals: registry(),
        // a wait without any cycle length, and a stray preemption-off
        phase_skip_events: vec![
            event("d1", "2024-03-10 08:00:00", 612, 300),
            event("d1", "2024-03-10 08:05:00", 104, 1),
        ]
        .into(),
        availability: TableInput::Invalid(phasewatch::detect::DetectError::SchemaMismatch {
            table: "has_data".into(),
            column: "TimeStamp".into(),
        }),
        ..RunInputs::default()
    };
    let outcome = engine.run(&inputs, &RunState::default(), day(10)).unwrap();

    assert_eq!(outcome.malformed_events, 2);
    assert!(!outcome.categories[&Category::PhaseSkip].is_failed());
    assert!(outcome.categories[&Category::MissingData].is_failed());
    assert!(matches!(
        outcome.categories[&Category::MaxOut],
        CategoryOutcome::Completed { .. }
    ));
}

#[test]
fn test_retention_prunes_old_history_through_the_engine() {
    let config = ReportConfig { alert_retention_weeks: 2, ..ReportConfig::default() };
    let engine = AlertEngine::new(config).unwrap();

    let mut old = PastAlerts::new();
    old.upsert(s1_phase2(), day(1));
    let mut recent = PastAlerts::new();
    recent.upsert(AlertKey::region("North"), day(20));
    let mut state = RunState::default();
    state.history.set(Category::MaxOut, old);
    state.history.set(Category::SystemOutage, recent);

    let inputs = RunInputs { signals: registry(), ..RunInputs::default() };
    let outcome = engine.run(&inputs, &state, day(25)).unwrap();

    assert_eq!(outcome.history.table(Category::MaxOut).map(|t| t.len()), Some(0));
    assert_eq!(
        outcome
            .history
            .table(Category::SystemOutage)
            .and_then(|t| t.last_alert(&AlertKey::region("North"))),
        Some(day(20))
    );
}

#[test]
fn test_run_report_persists_state_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("signals.csv"),
        "DeviceId,Name,Region\nd1,Oak & 5th,South\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("phase_skip_events.csv"),
        "deviceid,timestamp,eventid,parameter\n\
         d1,2024-01-15 14:22:30,612,200\n\
         d1,2024-01-15 14:22:31,612,200\n\
         d1,2024-01-15 14:22:35,132,120\n",
    )
    .unwrap();
    let db = dir.path().join("state.db");

    let first = phasewatch::run_report(dir.path(), None, &db, ReportConfig::default()).unwrap();
    assert_eq!(first.evaluation_date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    let alerts = first.alerts(Category::PhaseSkip);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].value, 2.0);

    let second = phasewatch::run_report(dir.path(), None, &db, ReportConfig::default()).unwrap();
    assert_eq!(second.total_alerts(), 0);
    assert_ne!(first.run_id, second.run_id);
}
