use std::fs;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::graph::FlowConfigError;
use crate::flow::step::InputKind;

/// Why a persisted flow definition could not be read or converted.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("flow `{flow}` step `{step}` has invalid validation pattern `{pattern}`: {source}")]
    InvalidPattern {
        flow: String,
        step: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("flow `{flow}` step `{step}` references unknown data source `{source_name}`")]
    UnknownDataSource {
        flow: String,
        step: String,
        source_name: String,
    },

    #[error(transparent)]
    Graph(#[from] FlowConfigError),
}

/// Message shape of a persisted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Text,
    Button,
    List,
}

/// Reply kind a persisted step declares. `Location` has no runtime analog on
/// the inbound side and collapses to accepting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedInput {
    Text,
    Button,
    List,
    Location,
    Any,
    None,
}

impl ExpectedInput {
    pub fn input_kind(self) -> InputKind {
        match self {
            ExpectedInput::Text => InputKind::Text,
            ExpectedInput::Button => InputKind::ButtonReply,
            ExpectedInput::List => InputKind::ListReply,
            ExpectedInput::Location => InputKind::Any,
            ExpectedInput::Any => InputKind::Any,
            ExpectedInput::None => InputKind::None,
        }
    }
}

/// A flow as persisted by the admin console.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredFlow {
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub steps: Vec<StoredStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredStep {
    /// Generated identity from the backing store. Steps are addressed by
    /// `code`; when present and different, this becomes an extra lookup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: String,
    #[serde(default)]
    pub order: i32,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_input: Option<ExpectedInput>,
    pub message_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_footer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_button_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_response_as: Option<String>,
    #[serde(default)]
    pub transfer_to_agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_to_flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_data_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<StoredOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<StoredTransition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredOption {
    pub option_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransition {
    /// Matched against the raw input; `*` is the wildcard.
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_to_flow: Option<String>,
    #[serde(default)]
    pub order: i32,
}

impl StoredTransition {
    pub fn is_wildcard(&self) -> bool {
        self.condition.trim() == "*"
    }
}

impl StoredFlow {
    pub fn from_json(contents: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(contents)
            .map_err(|e| DefinitionError::Parse(format!("JSON parse error: {}", e)))
    }

    pub fn from_yaml(contents: &str) -> Result<Self, DefinitionError> {
        serde_yaml_bw::from_str(contents)
            .map_err(|e| DefinitionError::Parse(format!("YAML parse error: {}", e)))
    }

    /// Reads a definition file, dispatching on the extension.
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DefinitionError::Io(format!("read error: {}", e)))?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        match ext.as_str() {
            "json" => Self::from_json(&contents),
            "yaml" | "yml" => Self::from_yaml(&contents),
            other => Err(DefinitionError::Parse(format!(
                "unsupported extension `{}` (expected .json, .yaml or .yml)",
                other
            ))),
        }
    }

    /// Steps sorted by their explicit order, code as tie-breaker. The first
    /// entry is the flow's initial step.
    pub fn steps_in_order(&self) -> Vec<&StoredStep> {
        let mut steps: Vec<&StoredStep> = self.steps.iter().collect();
        steps.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.code.cmp(&b.code)));
        steps
    }
}

impl StoredStep {
    /// The declared expected input, or one derived from the message shape
    /// when the author left it out.
    pub fn expected_input_kind(&self) -> InputKind {
        match self.expected_input {
            Some(expected) => expected.input_kind(),
            None => match self.step_type {
                StepType::Text => InputKind::Text,
                StepType::Button => InputKind::ButtonReply,
                StepType::List => InputKind::ListReply,
            },
        }
    }

    pub fn options_in_order(&self) -> Vec<&StoredOption> {
        let mut options: Vec<&StoredOption> = self.options.iter().collect();
        options.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.option_id.cmp(&b.option_id)));
        options
    }

    pub fn transitions_in_order(&self) -> Vec<&StoredTransition> {
        let mut transitions: Vec<&StoredTransition> = self.transitions.iter().collect();
        transitions.sort_by_key(|t| t.order);
        transitions
    }
}
