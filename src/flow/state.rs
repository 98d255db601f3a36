use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key under which a cross-flow switch records the flow the data came from,
/// so the receiving flow does not mistake carried-over answers for its own.
pub const FROM_FLOW_KEY: &str = "_from_flow";

/// Answers accumulated while walking a flow, keyed by each step's `save_as`.
///
/// The bag is rebuilt per turn: [`FlowData::with`] returns a new bag and
/// leaves the caller's copy untouched, so a persisted state is never mutated
/// behind the caller's back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct FlowData(HashMap<String, String>);

impl FlowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// New bag with `key` set. An existing value under the same key is
    /// overwritten in the copy.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> FlowData {
        let mut next = self.0.clone();
        next.insert(key.into(), value.into());
        FlowData(next)
    }

    /// New bag tagged as carried over from `flow_type` during a flow switch.
    pub fn carried_from(&self, flow_type: &str) -> FlowData {
        self.with(FROM_FLOW_KEY, flow_type)
    }

    /// The flow this data was carried over from, if any.
    pub fn from_flow(&self) -> Option<&str> {
        self.get(FROM_FLOW_KEY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for FlowData {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        FlowData(iter.into_iter().collect())
    }
}

/// Per-conversation flow position, owned and persisted by the caller. The
/// engine only ever reads it and hands back a replacement; it never writes
/// through this record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_step: Option<String>,
    #[serde(default, skip_serializing_if = "FlowData::is_empty")]
    pub flow_data: FlowData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_started_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    /// State with no flow in progress.
    pub fn inactive() -> Self {
        Self::default()
    }

    /// State positioned at the start of `flow_type`.
    pub fn started(
        flow_type: impl Into<String>,
        step_id: impl Into<String>,
        data: FlowData,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_type: Some(flow_type.into()),
            flow_step: Some(step_id.into()),
            flow_data: data,
            flow_started_at: Some(now),
        }
    }

    /// Same flow, advanced to `step_id` with a fresh data bag. The start
    /// timestamp is kept so the timeout clock keeps running.
    pub fn at_step(&self, step_id: impl Into<String>, data: FlowData) -> Self {
        Self {
            flow_type: self.flow_type.clone(),
            flow_step: Some(step_id.into()),
            flow_data: data,
            flow_started_at: self.flow_started_at,
        }
    }

    /// True when both a flow and a step are recorded, regardless of age.
    pub fn is_in_flow(&self) -> bool {
        self.flow_type.is_some() && self.flow_step.is_some()
    }

    /// True while the recorded position is still within `timeout_minutes` of
    /// its start. A state without a start timestamp is never active.
    pub fn is_active_at(&self, timeout_minutes: u32, now: DateTime<Utc>) -> bool {
        if !self.is_in_flow() {
            return false;
        }
        match self.flow_started_at {
            Some(started) => {
                now.signed_duration_since(started) <= chrono::Duration::minutes(timeout_minutes as i64)
            }
            None => false,
        }
    }
}
