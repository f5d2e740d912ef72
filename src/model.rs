//! Value types shared by the detectors, the lifecycle manager and the I/O edges.
//!
//! Every table here is plain owned data. A run borrows its inputs and hands
//! back fresh values; nothing in the core keeps a reference past a run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

/// Controller identifier as it appears in the signal registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The six independent issue categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    MaxOut,
    Actuations,
    MissingData,
    Pedestrian,
    SystemOutage,
    PhaseSkip,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::MaxOut,
        Category::Actuations,
        Category::MissingData,
        Category::Pedestrian,
        Category::SystemOutage,
        Category::PhaseSkip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::MaxOut => "max_out",
            Category::Actuations => "actuations",
            Category::MissingData => "missing_data",
            Category::Pedestrian => "pedestrian",
            Category::SystemOutage => "system_outage",
            Category::PhaseSkip => "phase_skip",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown alert category '{}'", s))
    }
}

/// Identity of an issue for suppression and history purposes.
///
/// Ordering is derived so history tables iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKey {
    Device { device_id: DeviceId },
    Phase { device_id: DeviceId, phase: u16 },
    Detector { device_id: DeviceId, detector: u16 },
    Region { region: String },
}

impl AlertKey {
    pub fn device(device_id: &DeviceId) -> Self {
        AlertKey::Device { device_id: device_id.clone() }
    }

    pub fn phase(device_id: &DeviceId, phase: u16) -> Self {
        AlertKey::Phase { device_id: device_id.clone(), phase }
    }

    pub fn detector(device_id: &DeviceId, detector: u16) -> Self {
        AlertKey::Detector { device_id: device_id.clone(), detector }
    }

    pub fn region(region: impl Into<String>) -> Self {
        AlertKey::Region { region: region.into() }
    }

    /// Device the key belongs to; `None` for region-grain keys.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            AlertKey::Device { device_id }
            | AlertKey::Phase { device_id, .. }
            | AlertKey::Detector { device_id, .. } => Some(device_id),
            AlertKey::Region { .. } => None,
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKey::Device { device_id } => write!(f, "{}", device_id),
            AlertKey::Phase { device_id, phase } => write!(f, "{} phase {}", device_id, phase),
            AlertKey::Detector { device_id, detector } => {
                write!(f, "{} detector {}", device_id, detector)
            }
            AlertKey::Region { region } => write!(f, "region {}", region),
        }
    }
}

// ---------------------------------------------------------------------------
// Input rows
// ---------------------------------------------------------------------------

/// Signal registry row. Required for every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Region")]
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceMeasure {
    MaxOut,
    ForceOff,
    GapOut,
    #[serde(other)]
    Other,
}

impl PerformanceMeasure {
    /// Max-outs and force-offs both end a phase before demand was served.
    pub fn is_max_out(&self) -> bool {
        matches!(self, PerformanceMeasure::MaxOut | PerformanceMeasure::ForceOff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRow {
    #[serde(rename = "TimeStamp", deserialize_with = "crate::ingest::de_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,
    #[serde(rename = "Phase")]
    pub phase: u16,
    #[serde(rename = "PerformanceMeasure")]
    pub performance_measure: PerformanceMeasure,
    #[serde(rename = "Total")]
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorRow {
    #[serde(rename = "TimeStamp", deserialize_with = "crate::ingest::de_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,
    #[serde(rename = "Detector")]
    pub detector: u16,
    #[serde(rename = "Total")]
    pub total: f64,
    #[serde(default)]
    pub prediction: Option<f64>,
    #[serde(default, deserialize_with = "crate::ingest::de_flag")]
    pub anomaly: Option<bool>,
}

/// Presence-only heartbeat; absence over the expected cadence is missing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityPulse {
    #[serde(rename = "TimeStamp", deserialize_with = "crate::ingest::de_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedestrianRow {
    #[serde(rename = "TimeStamp", deserialize_with = "crate::ingest::de_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,
    #[serde(rename = "Phase")]
    pub phase: u16,
    #[serde(rename = "PedActuation")]
    pub ped_actuation: f64,
    #[serde(rename = "PedServices")]
    pub ped_services: f64,
}

/// Raw high-resolution controller event used by the phase-skip detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSkipEvent {
    #[serde(rename = "deviceid")]
    pub device_id: DeviceId,
    #[serde(deserialize_with = "crate::ingest::de_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "eventid")]
    pub event_id: i32,
    pub parameter: i64,
}

/// An optional input table as handed to the engine.
#[derive(Debug, Clone)]
pub enum TableInput<T> {
    /// Not supplied; behaves like an empty table.
    Missing,
    Loaded(Vec<T>),
    /// Supplied but unusable. Fails only the categories that read it.
    Invalid(DetectError),
}

impl<T> Default for TableInput<T> {
    fn default() -> Self {
        TableInput::Missing
    }
}

impl<T> From<Vec<T>> for TableInput<T> {
    fn from(rows: Vec<T>) -> Self {
        TableInput::Loaded(rows)
    }
}

impl<T> TableInput<T> {
    pub fn rows(&self) -> Result<&[T], DetectError> {
        match self {
            TableInput::Missing => Ok(&[]),
            TableInput::Loaded(rows) => Ok(rows),
            TableInput::Invalid(err) => Err(err.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TableInput::Loaded(rows) => rows.is_empty(),
            TableInput::Missing => true,
            TableInput::Invalid(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Daily metrics
// ---------------------------------------------------------------------------

/// One day of a monitored metric. `volume` is the denominator or count the
/// value was derived from (services, actuations, pulses).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyObservation {
    pub value: f64,
    pub volume: f64,
}

impl DailyObservation {
    pub fn new(value: f64, volume: f64) -> Self {
        Self { value, volume }
    }
}

/// Time-indexed table keyed by (device, sub-unit, day).
///
/// A day with no row is a gap, not a zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    rows: BTreeMap<AlertKey, BTreeMap<NaiveDate, DailyObservation>>,
}

impl MetricSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one observation, returning the one it replaced.
    pub fn insert(
        &mut self,
        key: AlertKey,
        day: NaiveDate,
        observation: DailyObservation,
    ) -> Option<DailyObservation> {
        self.rows.entry(key).or_default().insert(day, observation)
    }

    pub fn get(&self, key: &AlertKey, day: NaiveDate) -> Option<&DailyObservation> {
        self.rows.get(key).and_then(|days| days.get(&day))
    }

    pub fn days(&self, key: &AlertKey) -> Option<&BTreeMap<NaiveDate, DailyObservation>> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AlertKey, &BTreeMap<NaiveDate, DailyObservation>)> {
        self.rows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &AlertKey> {
        self.rows.keys()
    }

    /// Total number of (key, day) rows.
    pub fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Alerts and history
// ---------------------------------------------------------------------------

/// One (key, day) that cleared every gate of its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub category: Category,
    pub key: AlertKey,
    pub day: NaiveDate,
    /// The driving metric (percent max-out, missing proportion, skip count, ...).
    pub value: f64,
    pub alert: bool,
    #[serde(default)]
    pub signal_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Category-specific supporting numbers.
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl AlertCandidate {
    pub fn new(category: Category, key: AlertKey, day: NaiveDate, value: f64) -> Self {
        Self {
            category,
            key,
            day,
            value,
            alert: true,
            signal_name: None,
            region: None,
            evidence: serde_json::Value::Null,
        }
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastAlertRecord {
    pub key: AlertKey,
    pub date: NaiveDate,
}

/// Past-alert table for one category: latest reported date per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<PastAlertRecord>", into = "Vec<PastAlertRecord>")]
pub struct PastAlerts {
    records: BTreeMap<AlertKey, NaiveDate>,
}

impl PastAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_alert(&self, key: &AlertKey) -> Option<NaiveDate> {
        self.records.get(key).copied()
    }

    /// Record `date` for `key` unless a later date is already stored.
    /// Returns whether the stored date changed.
    pub fn upsert(&mut self, key: AlertKey, date: NaiveDate) -> bool {
        match self.records.get_mut(&key) {
            Some(existing) if *existing >= date => false,
            Some(existing) => {
                *existing = date;
                true
            }
            None => {
                self.records.insert(key, date);
                true
            }
        }
    }

    /// Drop every record dated before `cutoff`.
    pub fn retain_since(&mut self, cutoff: NaiveDate) {
        self.records.retain(|_, date| *date >= cutoff);
    }

    pub fn records(&self) -> impl Iterator<Item = PastAlertRecord> + '_ {
        self.records
            .iter()
            .map(|(key, date)| PastAlertRecord { key: key.clone(), date: *date })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<PastAlertRecord>> for PastAlerts {
    fn from(records: Vec<PastAlertRecord>) -> Self {
        records.into_iter().collect()
    }
}

impl From<PastAlerts> for Vec<PastAlertRecord> {
    fn from(table: PastAlerts) -> Self {
        table.records().collect()
    }
}

impl FromIterator<PastAlertRecord> for PastAlerts {
    fn from_iter<I: IntoIterator<Item = PastAlertRecord>>(iter: I) -> Self {
        let mut table = PastAlerts::new();
        for record in iter {
            table.upsert(record.key, record.date);
        }
        table
    }
}

/// Past-alert tables for every category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertHistory {
    tables: BTreeMap<Category, PastAlerts>,
}

impl AlertHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, category: Category) -> Option<&PastAlerts> {
        self.tables.get(&category)
    }

    /// Owned copy of a category's table (empty if none).
    pub fn table_or_default(&self, category: Category) -> PastAlerts {
        self.tables.get(&category).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, category: Category, table: PastAlerts) {
        self.tables.insert(category, table);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &PastAlerts)> {
        self.tables.iter().map(|(c, t)| (*c, t))
    }

    pub fn total_records(&self) -> usize {
        self.tables.values().map(PastAlerts::len).sum()
    }
}
