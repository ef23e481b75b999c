//! Cohort learning-analytics pipeline.
//!
//! Learner profiles, activity logs and outcome mappings are loaded from a
//! [`RecordSource`], reduced to one [`MetricRow`] per treatment label, and the
//! raw and grouped snapshots are written back through a [`SnapshotSink`].
//! [`build_metrics`] is the single entrypoint hosts are expected to call.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// A schemaless stored record.
pub type Document = Map<String, Value>;

pub const LEARNER_ID_FIELD: &str = "_id";
pub const TREATMENT_LABEL_FIELD: &str = "recommendation_method";
pub const SELECTED_FIELD: &str = "selected";
pub const LAUNCH_COUNT_FIELD: &str = "launch_count";

pub const LOG_LEARNER_FIELD: &str = "learner_id";
pub const LOG_ACTIVITY_FIELD: &str = "activity_id";
pub const LOG_VALUE_FIELD: &str = "value";

/// Accepted spellings of the outcome identifier, tried in order.
pub const OUTCOME_ID_FIELDS: [&str; 3] = ["Outcome ID", "Outcome_ID", "OutcomeID"];
pub const ASSESSES_FIELD: &str = "Assesses";

pub const LAUNCH_ACTIVITY: &str = "launch";
pub const RECOMMENDATION_CLICK_ACTIVITY: &str = "recommended_item_selected";

pub const ROUNDING_DECIMALS: i32 = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Learners,
    Logs,
    Outcomes,
}

impl Dataset {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Learners => "learners",
            Self::Logs => "logs",
            Self::Outcomes => "outcomes",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "learners" => Some(Self::Learners),
            "logs" => Some(Self::Logs),
            "outcomes" => Some(Self::Outcomes),
            _ => None,
        }
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTable {
    RawLearners,
    GroupedMetrics,
}

impl SnapshotTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawLearners => "raw_learners",
            Self::GroupedMetrics => "grouped_metrics",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw_learners" => Some(Self::RawLearners),
            "grouped_metrics" => Some(Self::GroupedMetrics),
            _ => None,
        }
    }
}

impl Display for SnapshotTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("{0} dataset is empty")]
    EmptyDataset(Dataset),
    #[error("invalid {dataset} record at index {index}: {reason}")]
    InvalidRecord {
        dataset: Dataset,
        index: usize,
        reason: String,
    },
    #[error("storage error during {operation}")]
    Storage {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MetricsError {
    pub fn storage(
        operation: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            operation,
            source: source.into(),
        }
    }
}

/// Read side of the backing store. Every call returns the full collection.
pub trait RecordSource {
    fn fetch_learners(&self) -> Result<Vec<Document>, MetricsError>;
    fn fetch_logs(&self) -> Result<Vec<Document>, MetricsError>;
    fn fetch_outcomes(&self) -> Result<Vec<Document>, MetricsError>;
}

/// Write side of the backing store.
///
/// `delete_all` and `insert_many` are separate steps with no atomicity across
/// them. A reader between the two observes an empty snapshot, and concurrent
/// writers resolve as last-writer-wins.
pub trait SnapshotSink {
    fn delete_all(&mut self, table: SnapshotTable) -> Result<(), MetricsError>;
    fn insert_many(
        &mut self,
        table: SnapshotTable,
        documents: &[Document],
    ) -> Result<(), MetricsError>;

    /// Clears `table`, then inserts `documents` unless the batch is empty.
    fn replace_all(
        &mut self,
        table: SnapshotTable,
        documents: &[Document],
    ) -> Result<(), MetricsError> {
        self.delete_all(table)?;
        if !documents.is_empty() {
            self.insert_many(table, documents)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnerRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "recommendation_method")]
    pub treatment_label: String,
    pub selected: f64,
    pub launch_count: f64,
    /// Remaining document fields, carried into the raw snapshot untouched.
    #[serde(flatten)]
    pub attributes: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub learner_id: Option<String>,
    pub activity_id: Option<String>,
    /// `None` when the key is absent, `Some(Value::Null)` when stored as null.
    pub value: Option<Value>,
}

impl LogEntry {
    #[must_use]
    pub fn from_document(document: &Document) -> Self {
        Self {
            learner_id: document.get(LOG_LEARNER_FIELD).and_then(coerce_identifier),
            activity_id: document.get(LOG_ACTIVITY_FIELD).and_then(coerce_identifier),
            value: document.get(LOG_VALUE_FIELD).cloned(),
        }
    }

    #[must_use]
    pub fn has_value_field(&self) -> bool {
        self.value.is_some()
    }

    fn is_activity(&self, activity: &str) -> bool {
        self.activity_id.as_deref() == Some(activity)
    }
}

/// Outcome identifier to the item/activity identifiers it assesses.
///
/// Records without a usable identifier are not dropped. They share one
/// unkeyed slot (the `None` key), which counts as a single extra outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeMap {
    outcomes: BTreeMap<Option<String>, Vec<String>>,
}

impl OutcomeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome_id: impl Into<String>, assessed_id: impl Into<String>) {
        self.push_slot(Some(outcome_id.into()), assessed_id.into());
    }

    pub fn push_unkeyed(&mut self, assessed_id: impl Into<String>) {
        self.push_slot(None, assessed_id.into());
    }

    #[must_use]
    pub fn assessed_by(&self, outcome_id: &str) -> Option<&[String]> {
        self.outcomes
            .get(&Some(outcome_id.to_string()))
            .map(Vec::as_slice)
    }

    /// Items collected from records that had no identifier.
    #[must_use]
    pub fn unkeyed(&self) -> Option<&[String]> {
        self.outcomes.get(&None).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &[String])> {
        self.outcomes
            .iter()
            .map(|(outcome_id, items)| (outcome_id.as_deref(), items.as_slice()))
    }

    /// Number of outcome slots, the unkeyed slot included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Adds every token of one outcome document. Returns `false` when no
    /// identifier could be resolved and the tokens went to the unkeyed slot.
    pub fn extend_from_document(&mut self, document: &Document) -> bool {
        let outcome_id = resolve_outcome_id(document);
        let keyed = outcome_id.is_some();
        for token in assessed_tokens(document.get(ASSESSES_FIELD)) {
            self.push_slot(outcome_id.clone(), token);
        }
        keyed
    }

    fn push_slot(&mut self, outcome_id: Option<String>, assessed_id: String) {
        self.outcomes.entry(outcome_id).or_default().push(assessed_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRow {
    #[serde(rename = "recommendation_method")]
    pub treatment_label: String,
    pub group_size: u64,
    pub retention: f64,
    pub engagement: f64,
    pub ctr_clicks: u64,
    pub mastery_rate: f64,
    #[serde(rename = "CTR")]
    pub ctr: f64,
}

impl MetricRow {
    /// Derives `CTR` and rounds every float column.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_aggregates(
        treatment_label: String,
        group_size: u64,
        retention: f64,
        engagement: f64,
        ctr_clicks: u64,
        mastery_rate: f64,
    ) -> Self {
        // Labels come from the learner set, so group_size is never zero here.
        let ctr = if group_size == 0 {
            0.0
        } else {
            ctr_clicks as f64 / group_size as f64
        };

        Self {
            treatment_label,
            group_size,
            retention: round_decimals(retention, ROUNDING_DECIMALS),
            engagement: round_decimals(engagement, ROUNDING_DECIMALS),
            ctr_clicks,
            mastery_rate: round_decimals(mastery_rate, ROUNDING_DECIMALS),
            ctr: round_decimals(ctr, ROUNDING_DECIMALS),
        }
    }
}

/// Grouped result, one row per treatment label, sorted by label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MetricsTable {
    rows: Vec<MetricRow>,
}

impl MetricsTable {
    #[must_use]
    pub fn from_rows(mut rows: Vec<MetricRow>) -> Self {
        rows.sort_by(|lhs, rhs| lhs.treatment_label.cmp(&rhs.treatment_label));
        Self { rows }
    }

    #[must_use]
    pub fn rows(&self) -> &[MetricRow] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<MetricRow> {
        self.rows
    }

    #[must_use]
    pub fn row(&self, treatment_label: &str) -> Option<&MetricRow> {
        self.rows
            .iter()
            .find(|row| row.treatment_label == treatment_label)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_documents(&self) -> Result<Vec<Document>, MetricsError> {
        self.rows.iter().map(to_document).collect()
    }

    /// Rebuilds a table from grouped snapshot documents.
    pub fn from_documents(documents: Vec<Document>) -> Result<Self, MetricsError> {
        let rows = documents
            .into_iter()
            .map(|document| {
                serde_json::from_value::<MetricRow>(Value::Object(document)).map_err(|err| {
                    MetricsError::Serialization(format!("invalid grouped snapshot row: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_rows(rows))
    }
}

/// Coerces a stored value to a number, defaulting to `0.0`.
///
/// Shared by every "parse or zero" field so their edge cases stay identical.
/// Infinities such as `"inf"` survive; only `NaN` collapses to zero.
#[must_use]
pub fn lenient_number(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        Some(Value::Bool(flag)) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|number| !number.is_nan()).unwrap_or(0.0)
}

/// Parses a log value as a mastery score.
///
/// Only plain non-negative decimals qualify: ASCII digits with at most one
/// decimal point. Anything else is skipped rather than reported.
#[must_use]
pub fn parse_score(value: &Value) -> Option<f64> {
    let text = match value {
        Value::String(raw) => Cow::Borrowed(raw.as_str()),
        Value::Number(number) => Cow::Owned(number.to_string()),
        _ => return None,
    };

    let mut digits = 0_usize;
    let mut points = 0_usize;
    for ch in text.chars() {
        match ch {
            '0'..='9' => digits += 1,
            '.' => points += 1,
            _ => return None,
        }
    }
    if digits == 0 || points > 1 {
        return None;
    }

    text.parse::<f64>().ok()
}

/// Coerces an identifier-like value to its string form.
#[must_use]
pub fn coerce_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Object(fields) => match fields.get("$oid") {
            Some(Value::String(oid)) => Some(oid.clone()),
            _ => None,
        },
        Value::Null | Value::Array(_) => None,
    }
}

/// Rounds half-to-even at `decimals` places.
#[must_use]
pub fn round_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// First truthy identifier among [`OUTCOME_ID_FIELDS`]. Empty strings, zero,
/// `false`, `null` and empty containers fall through to the next spelling.
fn resolve_outcome_id(document: &Document) -> Option<String> {
    OUTCOME_ID_FIELDS
        .iter()
        .filter_map(|field| document.get(*field))
        .find(|value| is_truthy(value))
        .and_then(coerce_identifier)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        #[allow(clippy::float_cmp)]
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(raw) => !raw.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn assessed_tokens(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(coerce_identifier).collect(),
        Some(other) => coerce_identifier(other).into_iter().collect(),
        None => Vec::new(),
    };

    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn learner_from_document(
    index: usize,
    mut document: Document,
) -> Result<LearnerRecord, MetricsError> {
    let invalid = |reason: String| MetricsError::InvalidRecord {
        dataset: Dataset::Learners,
        index,
        reason,
    };

    let id = document
        .remove(LEARNER_ID_FIELD)
        .as_ref()
        .and_then(coerce_identifier)
        .ok_or_else(|| invalid(format!("missing {LEARNER_ID_FIELD}")))?;
    let treatment_label = document
        .remove(TREATMENT_LABEL_FIELD)
        .as_ref()
        .and_then(coerce_identifier)
        .ok_or_else(|| invalid(format!("missing {TREATMENT_LABEL_FIELD} for learner {id}")))?;
    let selected = lenient_number(document.remove(SELECTED_FIELD).as_ref());
    let launch_count = lenient_number(document.remove(LAUNCH_COUNT_FIELD).as_ref());

    Ok(LearnerRecord {
        id,
        treatment_label,
        selected,
        launch_count,
        attributes: document,
    })
}

/// Loads learners and keeps only unselected records.
///
/// # Errors
/// Returns [`MetricsError::EmptyDataset`] when the source holds no learners,
/// and [`MetricsError::InvalidRecord`] when a kept record lacks an identifier
/// or treatment label.
pub fn load_learners<S>(source: &S) -> Result<Vec<LearnerRecord>, MetricsError>
where
    S: RecordSource + ?Sized,
{
    let documents = source.fetch_learners()?;
    if documents.is_empty() {
        return Err(MetricsError::EmptyDataset(Dataset::Learners));
    }

    let fetched = documents.len();
    let mut learners = Vec::with_capacity(fetched);
    for (index, document) in documents.into_iter().enumerate() {
        #[allow(clippy::float_cmp)]
        let excluded = lenient_number(document.get(SELECTED_FIELD)) != 0.0;
        if excluded {
            continue;
        }
        learners.push(learner_from_document(index, document)?);
    }

    debug!(fetched, kept = learners.len(), "loaded learners");
    Ok(learners)
}

/// Loads every activity log. No filtering is applied.
///
/// # Errors
/// Returns [`MetricsError::EmptyDataset`] when the source holds no logs.
pub fn load_logs<S>(source: &S) -> Result<Vec<LogEntry>, MetricsError>
where
    S: RecordSource + ?Sized,
{
    let documents = source.fetch_logs()?;
    if documents.is_empty() {
        return Err(MetricsError::EmptyDataset(Dataset::Logs));
    }

    let logs: Vec<LogEntry> = documents.iter().map(LogEntry::from_document).collect();
    debug!(fetched = logs.len(), "loaded logs");
    Ok(logs)
}

/// Builds the outcome map. An empty outcome collection is not an error.
pub fn load_outcome_map<S>(source: &S) -> Result<OutcomeMap, MetricsError>
where
    S: RecordSource + ?Sized,
{
    let documents = source.fetch_outcomes()?;
    let mut map = OutcomeMap::new();
    for (index, document) in documents.iter().enumerate() {
        if !map.extend_from_document(document) {
            warn!(index, "outcome record has no identifier, grouping it as unkeyed");
        }
    }

    debug!(fetched = documents.len(), outcomes = map.len(), "loaded outcome map");
    Ok(map)
}

fn labels_by_learner(learners: &[LearnerRecord]) -> BTreeMap<&str, Vec<&str>> {
    let mut labels: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for learner in learners {
        labels
            .entry(learner.id.as_str())
            .or_default()
            .push(learner.treatment_label.as_str());
    }
    labels
}

fn count_per_learner<'a>(
    logs: &'a [LogEntry],
    keep: impl Fn(&LogEntry) -> bool,
) -> BTreeMap<&'a str, u64> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for entry in logs.iter().filter(|entry| keep(entry)) {
        if let Some(learner_id) = entry.learner_id.as_deref() {
            *counts.entry(learner_id).or_default() += 1;
        }
    }
    counts
}

/// Inner-joins per-learner values to labels. Learners missing on either side
/// contribute nothing.
fn join_labels<T: Copy>(
    per_learner: &BTreeMap<&str, T>,
    learners: &[LearnerRecord],
) -> BTreeMap<String, Vec<T>> {
    let labels = labels_by_learner(learners);
    let mut grouped: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (learner_id, value) in per_learner {
        for label in labels.get(learner_id).into_iter().flatten() {
            grouped.entry((*label).to_string()).or_default().push(*value);
        }
    }
    grouped
}

#[allow(clippy::cast_precision_loss)]
fn mean_per_label(grouped: BTreeMap<String, Vec<f64>>) -> BTreeMap<String, f64> {
    grouped
        .into_iter()
        .map(|(label, values)| {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            (label, mean)
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn mean_count_per_label(
    counts: &BTreeMap<&str, u64>,
    learners: &[LearnerRecord],
) -> BTreeMap<String, f64> {
    let as_float: BTreeMap<&str, f64> = counts
        .iter()
        .map(|(learner_id, count)| (*learner_id, *count as f64))
        .collect();
    mean_per_label(join_labels(&as_float, learners))
}

/// Learner count per label.
#[must_use]
pub fn group_size(learners: &[LearnerRecord]) -> BTreeMap<String, u64> {
    let mut sizes: BTreeMap<String, u64> = BTreeMap::new();
    for learner in learners {
        *sizes.entry(learner.treatment_label.clone()).or_default() += 1;
    }
    sizes
}

/// Mean `launch` count per label over learners with at least one launch.
#[must_use]
pub fn retention(logs: &[LogEntry], learners: &[LearnerRecord]) -> BTreeMap<String, f64> {
    let counts = count_per_learner(logs, |entry| entry.is_activity(LAUNCH_ACTIVITY));
    mean_count_per_label(&counts, learners)
}

/// Mean log count per label over learners with at least one log.
#[must_use]
pub fn engagement(logs: &[LogEntry], learners: &[LearnerRecord]) -> BTreeMap<String, f64> {
    let counts = count_per_learner(logs, |_| true);
    mean_count_per_label(&counts, learners)
}

/// Total recommendation clicks per label.
#[must_use]
pub fn ctr_clicks(logs: &[LogEntry], learners: &[LearnerRecord]) -> BTreeMap<String, u64> {
    let counts = count_per_learner(logs, |entry| {
        entry.is_activity(RECOMMENDATION_CLICK_ACTIVITY)
    });
    join_labels(&counts, learners)
        .into_iter()
        .map(|(label, clicks)| (label, clicks.iter().sum()))
        .collect()
}

/// Mean number of outcomes per learner with a positive score on any assessed
/// activity.
#[must_use]
pub fn mastery_rate(
    logs: &[LogEntry],
    learners: &[LearnerRecord],
    outcome_map: &OutcomeMap,
) -> BTreeMap<String, f64> {
    if !logs.iter().any(LogEntry::has_value_field) {
        return learners
            .iter()
            .map(|learner| (learner.treatment_label.clone(), 0.0))
            .collect();
    }

    let mut best_scores: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for entry in logs {
        let (Some(learner_id), Some(activity_id), Some(score)) = (
            entry.learner_id.as_deref(),
            entry.activity_id.as_deref(),
            entry.value.as_ref().and_then(parse_score),
        ) else {
            continue;
        };

        let best = best_scores
            .entry(learner_id)
            .or_default()
            .entry(activity_id)
            .or_insert(score);
        *best = best.max(score);
    }

    #[allow(clippy::cast_precision_loss)]
    let mastery_scores: BTreeMap<&str, f64> = best_scores
        .iter()
        .map(|(learner_id, scores)| {
            let mastered = outcome_map
                .iter()
                .filter(|(_, assessed)| {
                    assessed
                        .iter()
                        .any(|item| scores.get(item.as_str()).is_some_and(|score| *score > 0.0))
                })
                .count();
            (*learner_id, mastered as f64)
        })
        .collect();

    mean_per_label(join_labels(&mastery_scores, learners))
}

/// Runs the five calculators and inner-joins them on treatment label.
///
/// A label missing from any calculator is dropped, so labels without launches
/// or clicks do not appear.
#[must_use]
pub fn compute_metrics(
    learners: &[LearnerRecord],
    logs: &[LogEntry],
    outcome_map: &OutcomeMap,
) -> MetricsTable {
    let sizes = group_size(learners);
    let retention = retention(logs, learners);
    let engagement = engagement(logs, learners);
    let clicks = ctr_clicks(logs, learners);
    let mastery = mastery_rate(logs, learners, outcome_map);

    let mut rows = Vec::with_capacity(sizes.len());
    for (label, size) in sizes {
        let (Some(retention), Some(engagement), Some(clicks), Some(mastery)) = (
            retention.get(&label),
            engagement.get(&label),
            clicks.get(&label),
            mastery.get(&label),
        ) else {
            debug!(label = %label, "label dropped by metric join");
            continue;
        };

        rows.push(MetricRow::from_aggregates(
            label,
            size,
            *retention,
            *engagement,
            *clicks,
            *mastery,
        ));
    }

    MetricsTable::from_rows(rows)
}

/// Recomputes the grouped metrics and refreshes both snapshots.
///
/// Nothing is written until all three datasets have loaded. The raw learner
/// snapshot is replaced before the metrics are computed, the grouped snapshot
/// after.
///
/// # Errors
/// Returns [`MetricsError::EmptyDataset`] for empty learners or logs, and
/// propagates every source or sink failure.
pub fn build_metrics<T>(store: &mut T) -> Result<MetricsTable, MetricsError>
where
    T: RecordSource + SnapshotSink + ?Sized,
{
    let learners = load_learners(&*store)?;
    let logs = load_logs(&*store)?;
    let outcome_map = load_outcome_map(&*store)?;

    let raw = learners
        .iter()
        .map(to_document)
        .collect::<Result<Vec<_>, _>>()?;
    store.replace_all(SnapshotTable::RawLearners, &raw)?;

    let table = compute_metrics(&learners, &logs, &outcome_map);

    store.replace_all(SnapshotTable::GroupedMetrics, &table.to_documents()?)?;

    info!(
        learners = learners.len(),
        logs = logs.len(),
        outcomes = outcome_map.len(),
        groups = table.len(),
        "metrics rebuilt"
    );
    Ok(table)
}

fn to_document<T: Serialize>(value: &T) -> Result<Document, MetricsError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(other) => Err(MetricsError::Serialization(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(err) => Err(MetricsError::Serialization(err.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkOperation {
    DeleteAll(SnapshotTable),
    InsertMany(SnapshotTable, usize),
}

/// In-process store backed by vectors. Records every sink call so callers can
/// inspect the write sequence.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub learners: Vec<Document>,
    pub logs: Vec<Document>,
    pub outcomes: Vec<Document>,
    raw_snapshot: Vec<Document>,
    grouped_snapshot: Vec<Document>,
    operations: Vec<SinkOperation>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(learners: Vec<Document>, logs: Vec<Document>, outcomes: Vec<Document>) -> Self {
        Self {
            learners,
            logs,
            outcomes,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn snapshot(&self, table: SnapshotTable) -> &[Document] {
        match table {
            SnapshotTable::RawLearners => &self.raw_snapshot,
            SnapshotTable::GroupedMetrics => &self.grouped_snapshot,
        }
    }

    #[must_use]
    pub fn operations(&self) -> &[SinkOperation] {
        &self.operations
    }

    fn snapshot_mut(&mut self, table: SnapshotTable) -> &mut Vec<Document> {
        match table {
            SnapshotTable::RawLearners => &mut self.raw_snapshot,
            SnapshotTable::GroupedMetrics => &mut self.grouped_snapshot,
        }
    }
}

impl RecordSource for MemoryStore {
    fn fetch_learners(&self) -> Result<Vec<Document>, MetricsError> {
        Ok(self.learners.clone())
    }

    fn fetch_logs(&self) -> Result<Vec<Document>, MetricsError> {
        Ok(self.logs.clone())
    }

    fn fetch_outcomes(&self) -> Result<Vec<Document>, MetricsError> {
        Ok(self.outcomes.clone())
    }
}

impl SnapshotSink for MemoryStore {
    fn delete_all(&mut self, table: SnapshotTable) -> Result<(), MetricsError> {
        self.snapshot_mut(table).clear();
        self.operations.push(SinkOperation::DeleteAll(table));
        Ok(())
    }

    fn insert_many(
        &mut self,
        table: SnapshotTable,
        documents: &[Document],
    ) -> Result<(), MetricsError> {
        self.snapshot_mut(table).extend_from_slice(documents);
        self.operations
            .push(SinkOperation::InsertMany(table, documents.len()));
        Ok(())
    }
}
