use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::flow::definition::{
    DefinitionError, StepType, StoredFlow, StoredOption, StoredStep, StoredTransition,
};
use crate::flow::graph::{DEFAULT_TIMEOUT_MINUTES, Flow};
use crate::flow::manager::FlowManager;
use crate::flow::state::FlowData;
use crate::flow::step::{
    Condition, FlowStep, NextStep, Prompt, PromptResolverType, StepTarget, TransitionRule,
    Validator,
};
use crate::message::{
    ButtonContent, ButtonOption, ListContent, ListRow, ListSection, MessageContent,
};
use crate::util::{convert_placeholders, render_lenient};
use crate::watcher::{DirectoryWatcher, WatchedType};

/// File extensions recognized as flow definitions.
pub const FLOW_FILE_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Section label for list options whose author did not set one.
const DEFAULT_SECTION: &str = "Opciones";
/// Label on the button that opens a list when none is configured.
const DEFAULT_LIST_BUTTON: &str = "Ver opciones";

/// One row returned by an external lookup feeding a dynamic step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DataItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl DataItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            section: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// External lookup behind data-dependent steps ("stores near this zone").
/// Receives the answers accumulated so far and returns rows to offer. Lookup
/// failures are not swallowed; they surface to the caller of the turn.
#[async_trait]
pub trait DataSourceType: Send + Sync {
    async fn fetch(&self, data: &FlowData) -> anyhow::Result<Vec<DataItem>>;
}

pub type DataSource = Arc<dyn DataSourceType>;

/// Converts persisted flow definitions into runtime [`Flow`] graphs, wiring
/// dynamic steps to the data sources injected at construction.
#[derive(Default)]
pub struct FlowLoader {
    sources: HashMap<String, DataSource>,
}

impl FlowLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the lookup behind a `dynamicDataSource` name.
    pub fn with_source(mut self, name: impl Into<String>, source: DataSource) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Builds the runtime graph for a stored definition. The first step in
    /// explicit order becomes the initial step; every step is additionally
    /// indexed under its generated id when one is present.
    pub fn build_flow(&self, stored: &StoredFlow) -> Result<Flow, DefinitionError> {
        let ordered = stored.steps_in_order();

        let mut builder = Flow::builder(stored.name.clone())
            .description(stored.description.clone().unwrap_or_default())
            .timeout_minutes(stored.timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES));
        if let Some(first) = ordered.first() {
            builder = builder.initial_step(first.code.clone());
        }

        for step in &ordered {
            builder = builder.step(self.build_step(stored, step)?);
            if let Some(id) = &step.id {
                if id != &step.code {
                    builder = builder.alias(id.clone(), step.code.clone());
                }
            }
        }

        Ok(builder.build()?)
    }

    /// Parses and builds one definition file, returning the flow keyed by its
    /// stored code.
    pub fn load_file(&self, path: &Path) -> Result<(String, Flow), DefinitionError> {
        let stored = StoredFlow::from_file(path)?;
        let flow = self.build_flow(&stored)?;
        Ok((stored.code, flow))
    }

    /// Loads every definition under `dir` into the registry. A file that
    /// fails to load is logged and skipped so one bad definition cannot keep
    /// the rest from registering.
    pub fn load_dir(&self, manager: &FlowManager, dir: &Path) -> anyhow::Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_lowercase();
            if !FLOW_FILE_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            match self.load_file(&path) {
                Ok((code, flow)) => manager.register_flow(code, flow),
                Err(e) => error!("Failed to load {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn build_step(
        &self,
        flow: &StoredFlow,
        stored: &StoredStep,
    ) -> Result<FlowStep, DefinitionError> {
        let prompt = self.build_prompt(flow, stored)?;
        let mut step = FlowStep::new(stored.code.clone(), prompt)
            .with_expected_input(stored.expected_input_kind())
            .with_next(build_next(stored))
            .with_transfer_to_agent(stored.transfer_to_agent);

        if let Some(pattern) = &stored.validation_regex {
            let validator =
                Validator::pattern(pattern).map_err(|source| DefinitionError::InvalidPattern {
                    flow: flow.code.clone(),
                    step: stored.code.clone(),
                    pattern: pattern.clone(),
                    source,
                })?;
            step = step.with_validator(validator);
        }
        if let Some(message) = &stored.error_message {
            step = step.with_error_message(message.clone());
        }
        if let Some(key) = &stored.save_response_as {
            step = step.with_save_as(key.clone());
        }
        Ok(step)
    }

    fn build_prompt(
        &self,
        flow: &StoredFlow,
        stored: &StoredStep,
    ) -> Result<Prompt, DefinitionError> {
        let Some(source_name) = &stored.dynamic_data_source else {
            return Ok(Prompt::Static(static_content(stored)));
        };
        let source = self.sources.get(source_name).cloned().ok_or_else(|| {
            DefinitionError::UnknownDataSource {
                flow: flow.code.clone(),
                step: stored.code.clone(),
                source_name: source_name.clone(),
            }
        })?;
        Ok(Prompt::Dynamic(Arc::new(LookupPrompt {
            body: convert_placeholders(&stored.message_body),
            header: stored.message_header.as_deref().map(convert_placeholders),
            footer: stored.message_footer.as_deref().map(convert_placeholders),
            button_text: stored
                .list_button_text
                .clone()
                .unwrap_or_else(|| DEFAULT_LIST_BUTTON.to_string()),
            shape: stored.step_type,
            source,
        })))
    }
}

/// Compiles a step's routing. A step-level `switchToFlow` or
/// `transferToAgent` overrides its whole transition list.
fn build_next(stored: &StoredStep) -> NextStep {
    if let Some(code) = &stored.switch_to_flow {
        return NextStep::Fixed(StepTarget::SwitchFlow(code.clone()));
    }
    if stored.transfer_to_agent {
        return NextStep::Fixed(StepTarget::Transfer);
    }

    let default = default_target(stored);
    let transitions = stored.transitions_in_order();
    match transitions.as_slice() {
        [] => NextStep::Fixed(default),
        [only] if only.is_wildcard() => NextStep::Fixed(transition_target(only)),
        _ => NextStep::Conditional {
            rules: transitions
                .iter()
                .map(|t| TransitionRule {
                    condition: if t.is_wildcard() {
                        Condition::Any
                    } else {
                        Condition::Equals(t.condition.trim().to_string())
                    },
                    target: transition_target(t),
                })
                .collect(),
            default,
        },
    }
}

fn default_target(stored: &StoredStep) -> StepTarget {
    stored
        .default_next_step_id
        .clone()
        .map(StepTarget::Step)
        .unwrap_or(StepTarget::Complete)
}

fn transition_target(transition: &StoredTransition) -> StepTarget {
    if let Some(flow) = &transition.switch_to_flow {
        StepTarget::SwitchFlow(flow.clone())
    } else if let Some(step) = &transition.next_step_id {
        StepTarget::Step(step.clone())
    } else {
        StepTarget::Complete
    }
}

fn static_content(stored: &StoredStep) -> MessageContent {
    let body = convert_placeholders(&stored.message_body);
    let header = stored.message_header.as_deref().map(convert_placeholders);
    let footer = stored.message_footer.as_deref().map(convert_placeholders);

    match stored.step_type {
        StepType::Text => MessageContent::Text(composed_text(header, body, footer)),
        StepType::Button => {
            let buttons = stored
                .options_in_order()
                .iter()
                .map(|o| ButtonOption::new(&o.option_id, &o.title))
                .collect();
            let mut content = ButtonContent::new(body, buttons);
            content.header = header;
            content.footer = footer;
            MessageContent::Buttons(content)
        }
        StepType::List => {
            let sections = grouped_sections(&stored.options_in_order());
            let mut content = ListContent::new(
                body,
                stored
                    .list_button_text
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LIST_BUTTON.to_string()),
                sections,
            );
            content.header = header;
            content.footer = footer;
            MessageContent::List(content)
        }
    }
}

/// Plain-text messages fold header and footer into the body.
fn composed_text(header: Option<String>, body: String, footer: Option<String>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if let Some(header) = header {
        if !header.is_empty() {
            parts.push(header);
        }
    }
    parts.push(body);
    if let Some(footer) = footer {
        if !footer.is_empty() {
            parts.push(footer);
        }
    }
    parts.join("\n\n")
}

/// Groups options into sections by label, keeping first-appearance order.
fn grouped_sections(options: &[&StoredOption]) -> Vec<ListSection> {
    let mut labels: Vec<String> = Vec::new();
    let mut rows_by_label: HashMap<String, Vec<ListRow>> = HashMap::new();

    for option in options {
        let label = option
            .section
            .clone()
            .unwrap_or_else(|| DEFAULT_SECTION.to_string());
        let mut row = ListRow::new(&option.option_id, &option.title);
        if let Some(description) = &option.description {
            row = row.with_description(description);
        }
        if !rows_by_label.contains_key(&label) {
            labels.push(label.clone());
        }
        rows_by_label.entry(label).or_default().push(row);
    }

    labels
        .into_iter()
        .map(|label| {
            let rows = rows_by_label.remove(&label).unwrap_or_default();
            ListSection::new(label, rows)
        })
        .collect()
}

/// Prompt resolver for dynamic-data-source steps: interpolates the stored
/// texts against the flow data, runs the lookup, and shapes the rows into
/// channel content (truncated to transport caps by the content builders).
struct LookupPrompt {
    body: String,
    header: Option<String>,
    footer: Option<String>,
    button_text: String,
    shape: StepType,
    source: DataSource,
}

#[async_trait]
impl PromptResolverType for LookupPrompt {
    async fn resolve(&self, data: &FlowData) -> anyhow::Result<MessageContent> {
        let items = self.source.fetch(data).await?;
        let body = render_lenient(&self.body, data);
        let header = self.header.as_deref().map(|t| render_lenient(t, data));
        let footer = self.footer.as_deref().map(|t| render_lenient(t, data));

        Ok(match self.shape {
            StepType::Button => {
                let buttons = items
                    .iter()
                    .map(|item| ButtonOption::new(&item.id, &item.title))
                    .collect();
                let mut content = ButtonContent::new(body, buttons);
                content.header = header;
                content.footer = footer;
                MessageContent::Buttons(content)
            }
            StepType::List => {
                let sections = grouped_item_sections(&items);
                let mut content = ListContent::new(body, self.button_text.clone(), sections);
                content.header = header;
                content.footer = footer;
                MessageContent::List(content)
            }
            StepType::Text => {
                let mut lines = vec![composed_text(header, body, None)];
                for item in &items {
                    match &item.description {
                        Some(description) => lines.push(format!("• {} - {}", item.title, description)),
                        None => lines.push(format!("• {}", item.title)),
                    }
                }
                if let Some(footer) = footer {
                    if !footer.is_empty() {
                        lines.push(footer);
                    }
                }
                MessageContent::Text(lines.join("\n"))
            }
        })
    }
}

fn grouped_item_sections(items: &[DataItem]) -> Vec<ListSection> {
    let mut labels: Vec<String> = Vec::new();
    let mut rows_by_label: HashMap<String, Vec<ListRow>> = HashMap::new();

    for item in items {
        let label = item
            .section
            .clone()
            .unwrap_or_else(|| DEFAULT_SECTION.to_string());
        let mut row = ListRow::new(&item.id, &item.title);
        if let Some(description) = &item.description {
            row = row.with_description(description);
        }
        if !rows_by_label.contains_key(&label) {
            labels.push(label.clone());
        }
        rows_by_label.entry(label).or_default().push(row);
    }

    labels
        .into_iter()
        .map(|label| {
            let rows = rows_by_label.remove(&label).unwrap_or_default();
            ListSection::new(label, rows)
        })
        .collect()
}

/// Watches a directory of definition files, re-registering flows as admins
/// deploy new versions.
pub struct FlowDefinitionWatcher {
    loader: Arc<FlowLoader>,
    manager: Arc<FlowManager>,
}

impl FlowDefinitionWatcher {
    pub fn new(loader: Arc<FlowLoader>, manager: Arc<FlowManager>) -> Self {
        Self { loader, manager }
    }
}

#[async_trait]
impl WatchedType for FlowDefinitionWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| FLOW_FILE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        let (code, flow) = self.loader.load_file(path)?;
        self.manager.register_flow(code, flow);
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        info!("Flow definition removed: {:?}", path);
        Ok(())
    }
}

/// Starts watching `dir` for definition changes.
pub async fn watch_flow_dir(
    loader: Arc<FlowLoader>,
    manager: Arc<FlowManager>,
    dir: PathBuf,
) -> anyhow::Result<DirectoryWatcher> {
    let watcher = FlowDefinitionWatcher::new(loader, manager);
    DirectoryWatcher::new(dir, Arc::new(watcher), FLOW_FILE_EXTENSIONS, true).await
}
