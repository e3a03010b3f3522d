//! Per-job scheduling options
//!
//! A [`JobConfig`] controls when a job is due (`date`, `in`, `on`), its
//! priority, and the dedup guards applied on enqueue. It is built either with
//! the builder methods or parsed from a trailing JSON object in a positional
//! argument list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::due::Adjustment;
use super::error::{SchedulerError, SchedulerResult};
use super::lifecycle::CallbackOutcome;

/// Keys that mark a trailing JSON object as a job config
pub const CONFIG_KEYS: [&str; 8] = [
    "in", "on", "priority", "date", "data", "callback", "singular", "unique",
];

/// Callback invoked with the outcome of an enqueue or reschedule
pub type JobCallback = Arc<dyn Fn(&CallbackOutcome<'_>) + Send + Sync>;

/// Scheduling options for a single job
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Absolute base date, now when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,

    /// Amounts added to calendar fields, e.g. `{"days": 2}`
    #[serde(rename = "in", default, skip_serializing_if = "Map::is_empty")]
    pub offset: Map<String, Value>,

    /// Values written to calendar fields, e.g. `{"hour": 0}`
    #[serde(rename = "on", default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,

    /// Priority among equally-due jobs, 0 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Opaque caller data, not stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Reject when a pending job with the same name and arguments exists
    #[serde(default)]
    pub singular: bool,

    /// Reject when any job with the same name and arguments exists
    #[serde(default)]
    pub unique: bool,

    /// `on` was given before `in`, so overrides apply first
    #[serde(skip)]
    pub overrides_first: bool,

    #[serde(skip)]
    pub callback: Option<JobCallback>,
}

impl JobConfig {
    /// Empty config: due now, priority 0, no guards
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config object
    pub fn from_value(value: &Value) -> SchedulerResult<Self> {
        if !value.is_object() {
            return Err(SchedulerError::invalid_config(
                "config",
                format!("expected an object, got {value}"),
            ));
        }

        for (key, field) in [("in", "offset"), ("on", "fields")] {
            match value.get(key) {
                None | Some(Value::Null) | Some(Value::Object(_)) => {}
                Some(other) => {
                    return Err(SchedulerError::invalid_config(
                        key,
                        format!("expected an object of {field}, got {other}"),
                    ))
                }
            }
        }

        // A null offset or override means "not given".
        let mut value = value.clone();
        let mut overrides_first = false;
        if let Some(map) = value.as_object_mut() {
            map.retain(|_, v| !v.is_null());
            let position = |key: &str| map.keys().position(|k| k == key);
            overrides_first = matches!(
                (position("on"), position("in")),
                (Some(on), Some(offset)) if on < offset
            );
        }

        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| SchedulerError::invalid_config("config", e.to_string()))?;
        config.overrides_first = overrides_first;
        Ok(config)
    }

    /// Base the due date on `date` instead of now
    pub fn at(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Add `amount` to a calendar field, e.g. `after("minutes", 5)`
    pub fn after(mut self, unit: impl Into<String>, amount: i64) -> Self {
        self.offset.insert(unit.into(), Value::from(amount));
        self
    }

    /// Set a calendar field, e.g. `on("hour", 0)`
    pub fn on(mut self, unit: impl Into<String>, value: i64) -> Self {
        if self.offset.is_empty() && self.fields.is_empty() {
            self.overrides_first = true;
        }
        self.fields.insert(unit.into(), Value::from(value));
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn singular(mut self) -> Self {
        self.singular = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Receive the outcome of the operation this config is passed to
    pub fn callback(mut self, callback: impl Fn(&CallbackOutcome<'_>) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// The `in` and `on` sections in the order they were given
    pub fn sections(&self) -> [(Adjustment, &Map<String, Value>); 2] {
        let offset = (Adjustment::Add, &self.offset);
        let fields = (Adjustment::Set, &self.fields);
        if self.overrides_first {
            [fields, offset]
        } else {
            [offset, fields]
        }
    }

    /// Whether due-date fields are present
    pub fn has_schedule(&self) -> bool {
        self.date.is_some() || !self.offset.is_empty() || !self.fields.is_empty()
    }

    pub(crate) fn notify(&self, outcome: &CallbackOutcome<'_>) {
        if let Some(ref callback) = self.callback {
            callback(outcome);
        }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("date", &self.date)
            .field("in", &self.offset)
            .field("on", &self.fields)
            .field("priority", &self.priority)
            .field("data", &self.data)
            .field("singular", &self.singular)
            .field("unique", &self.unique)
            .field("overrides_first", &self.overrides_first)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// JavaScript-style truthiness of a JSON value
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether a positional value is a job config rather than a plain argument
pub fn is_config(value: &Value) -> bool {
    match value {
        Value::Object(map) => CONFIG_KEYS
            .iter()
            .any(|key| map.get(*key).is_some_and(is_truthy)),
        _ => false,
    }
}

/// Split a trailing job config off a positional argument list
pub fn split_config(mut args: Vec<Value>) -> SchedulerResult<(Vec<Value>, Option<JobConfig>)> {
    match args.last() {
        Some(last) if is_config(last) => {
            let config = JobConfig::from_value(last)?;
            args.pop();
            Ok((args, Some(config)))
        }
        _ => Ok((args, None)),
    }
}
