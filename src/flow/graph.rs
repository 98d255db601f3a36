use std::collections::HashMap;

use thiserror::Error;

use crate::flow::state::FlowData;
use crate::flow::step::{FlowStep, Prompt, StepTarget};
use crate::message::{ButtonContent, ListContent, MessageContent, OutboundMessage};
use crate::util::render_lenient;

/// Applied when a flow definition does not state its own timeout.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 30;

/// Why a flow graph could not be assembled.
#[derive(Debug, Error)]
pub enum FlowConfigError {
    #[error("flow `{flow}` has no steps")]
    Empty { flow: String },

    #[error("flow `{flow}` declares step `{step}` more than once")]
    DuplicateStep { flow: String, step: String },

    #[error("flow `{flow}` initial step `{step}` is not in the step set")]
    MissingInitialStep { flow: String, step: String },

    #[error("flow `{flow}` step `{step}` routes to unknown step `{target}`")]
    UnknownTarget {
        flow: String,
        step: String,
        target: String,
    },

    #[error("flow `{flow}` alias `{alias}` points at unknown step `{target}`")]
    UnknownAliasTarget {
        flow: String,
        alias: String,
        target: String,
    },

    #[error("step `{step}` has an invalid validation pattern: {source}")]
    InvalidPattern {
        step: String,
        #[source]
        source: regex::Error,
    },
}

/// An immutable, validated flow graph plus the operations the interpreter
/// needs: step lookup, prompt rendering and next-target resolution.
#[derive(Debug, Clone)]
pub struct Flow {
    name: String,
    description: String,
    steps: HashMap<String, FlowStep>,
    aliases: HashMap<String, String>,
    initial: String,
    timeout_minutes: u32,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timeout_minutes(&self) -> u32 {
        self.timeout_minutes
    }

    /// Looks a step up by its id, falling back to registered aliases.
    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.get(id).or_else(|| {
            self.aliases
                .get(id)
                .and_then(|canonical| self.steps.get(canonical))
        })
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.step(id).is_some()
    }

    pub fn initial_step(&self) -> &FlowStep {
        // the builder refuses to assemble a flow whose initial id is missing
        &self.steps[&self.initial]
    }

    pub fn steps(&self) -> impl Iterator<Item = &FlowStep> {
        self.steps.values()
    }

    /// Renders the step's prompt for `recipient`. Static prompts interpolate
    /// `{{key}}` placeholders against `data`; dynamic prompts are awaited and
    /// their failures handed back to the caller.
    pub async fn message_for_step(
        &self,
        step: &FlowStep,
        recipient: &str,
        data: &FlowData,
    ) -> anyhow::Result<OutboundMessage> {
        let content = match step.prompt() {
            Prompt::Static(content) => rendered_content(content, data),
            Prompt::Dynamic(resolver) => resolver.resolve(data).await?,
        };
        Ok(OutboundMessage::new(recipient, content))
    }

    /// Resolves where `step` routes for this input.
    pub fn next_target(&self, step: &FlowStep, input: &str) -> StepTarget {
        step.next().resolve(input)
    }

    /// True when the input passes the step's validator, or none is set.
    pub fn validate_input(&self, step: &FlowStep, input: &str) -> bool {
        step.validate(input)
    }
}

fn rendered_content(content: &MessageContent, data: &FlowData) -> MessageContent {
    match content {
        MessageContent::Text(body) => MessageContent::Text(render_lenient(body, data)),
        MessageContent::Buttons(c) => MessageContent::Buttons(ButtonContent {
            body: render_lenient(&c.body, data),
            header: c.header.as_deref().map(|t| render_lenient(t, data)),
            footer: c.footer.as_deref().map(|t| render_lenient(t, data)),
            buttons: c.buttons.clone(),
        }),
        MessageContent::List(c) => MessageContent::List(ListContent {
            body: render_lenient(&c.body, data),
            header: c.header.as_deref().map(|t| render_lenient(t, data)),
            footer: c.footer.as_deref().map(|t| render_lenient(t, data)),
            button_text: c.button_text.clone(),
            sections: c.sections.clone(),
        }),
    }
}

/// Assembles a [`Flow`], rejecting graphs that break its invariants.
pub struct FlowBuilder {
    name: String,
    description: String,
    timeout_minutes: u32,
    steps: Vec<FlowStep>,
    aliases: Vec<(String, String)>,
    initial: Option<String>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            steps: Vec::new(),
            aliases: Vec::new(),
            initial: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Registers an alternate lookup key for an existing step.
    pub fn alias(mut self, alias: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.aliases.push((alias.into(), step_id.into()));
        self
    }

    /// Overrides the initial step; defaults to the first step added.
    pub fn initial_step(mut self, id: impl Into<String>) -> Self {
        self.initial = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Flow, FlowConfigError> {
        let first_id = match self.steps.first() {
            Some(step) => step.id().to_string(),
            None => {
                return Err(FlowConfigError::Empty { flow: self.name });
            }
        };

        let mut steps = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            let id = step.id().to_string();
            if steps.insert(id.clone(), step).is_some() {
                return Err(FlowConfigError::DuplicateStep {
                    flow: self.name,
                    step: id,
                });
            }
        }

        let mut aliases = HashMap::with_capacity(self.aliases.len());
        for (alias, target) in self.aliases {
            if !steps.contains_key(&target) {
                return Err(FlowConfigError::UnknownAliasTarget {
                    flow: self.name,
                    alias,
                    target,
                });
            }
            aliases.insert(alias, target);
        }

        let initial = self.initial.unwrap_or(first_id);
        if !steps.contains_key(&initial) {
            return Err(FlowConfigError::MissingInitialStep {
                flow: self.name,
                step: initial,
            });
        }

        for step in steps.values() {
            for target in step.next().step_targets() {
                if !steps.contains_key(target) && !aliases.contains_key(target) {
                    return Err(FlowConfigError::UnknownTarget {
                        flow: self.name,
                        step: step.id().to_string(),
                        target: target.to_string(),
                    });
                }
            }
        }

        Ok(Flow {
            name: self.name,
            description: self.description,
            steps,
            aliases,
            initial,
            timeout_minutes: self.timeout_minutes,
        })
    }
}
