use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::flow::state::FlowData;
use crate::message::MessageContent;

/// The kind of reply a step is prepared to consume. `Any` accepts everything;
/// `None` marks steps that only present information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    ButtonReply,
    ListReply,
    Any,
    None,
}

impl InputKind {
    /// Whether a step expecting `self` should consume input of `incoming`
    /// kind. A mismatch is not an error; the caller re-prompts instead.
    pub fn accepts(self, incoming: InputKind) -> bool {
        self == InputKind::Any || self == incoming
    }
}

/// Where a finished step sends the conversation next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    /// Continue at another step of the same flow.
    Step(String),
    /// The flow ran to its natural end.
    Complete,
    /// Hand the conversation over to a human agent.
    Transfer,
    /// Restart inside another registered flow.
    SwitchFlow(String),
}

/// Async source for prompt content that depends on accumulated answers or an
/// external lookup. Failures propagate to the caller untouched.
#[async_trait]
pub trait PromptResolverType: Send + Sync {
    async fn resolve(&self, data: &FlowData) -> anyhow::Result<MessageContent>;
}

pub type PromptResolver = Arc<dyn PromptResolverType>;

/// A step's prompt: content known at build time, or content produced per turn.
#[derive(Clone)]
pub enum Prompt {
    Static(MessageContent),
    Dynamic(PromptResolver),
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Static(content) => f.debug_tuple("Static").field(content).finish(),
            Prompt::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Gate over raw input text. Steps without a validator accept everything.
#[derive(Clone)]
pub enum Validator {
    Pattern(Regex),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Validator {
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Validator::Pattern(Regex::new(pattern)?))
    }

    pub fn predicate(check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Validator::Predicate(Arc::new(check))
    }

    pub fn is_valid(&self, input: &str) -> bool {
        match self {
            Validator::Pattern(regex) => regex.is_match(input),
            Validator::Predicate(check) => check(input),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Validator::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One persisted transition, compiled: a condition over the raw input and the
/// target it routes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionRule {
    pub condition: Condition,
    pub target: StepTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Matches when the trimmed input equals the value exactly.
    Equals(String),
    /// Wildcard; matches any input.
    Any,
}

impl Condition {
    pub fn matches(&self, input: &str) -> bool {
        match self {
            Condition::Equals(value) => value == input.trim(),
            Condition::Any => true,
        }
    }
}

/// Next-step resolution: a single fixed target, or an ordered rule scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NextStep {
    Fixed(StepTarget),
    Conditional {
        rules: Vec<TransitionRule>,
        default: StepTarget,
    },
}

impl NextStep {
    pub fn fixed(target: StepTarget) -> Self {
        NextStep::Fixed(target)
    }

    pub fn conditional(rules: Vec<TransitionRule>, default: StepTarget) -> Self {
        NextStep::Conditional { rules, default }
    }

    /// Picks the target for `input`. Exact-equality rules win in list order;
    /// a wildcard only fires when no exact rule matched; otherwise the
    /// default applies.
    pub fn resolve(&self, input: &str) -> StepTarget {
        match self {
            NextStep::Fixed(target) => target.clone(),
            NextStep::Conditional { rules, default } => {
                let trimmed = input.trim();
                for rule in rules {
                    if let Condition::Equals(value) = &rule.condition {
                        if value == trimmed {
                            return rule.target.clone();
                        }
                    }
                }
                for rule in rules {
                    if rule.condition == Condition::Any {
                        return rule.target.clone();
                    }
                }
                default.clone()
            }
        }
    }

    /// Step ids this resolution can land on, for build-time graph checks.
    pub fn step_targets(&self) -> Vec<&str> {
        match self {
            NextStep::Fixed(target) => target_step_id(target).into_iter().collect(),
            NextStep::Conditional { rules, default } => rules
                .iter()
                .map(|r| &r.target)
                .chain(std::iter::once(default))
                .filter_map(target_step_id)
                .collect(),
        }
    }
}

fn target_step_id(target: &StepTarget) -> Option<&str> {
    match target {
        StepTarget::Step(id) => Some(id.as_str()),
        _ => None,
    }
}

/// One node of a flow graph.
#[derive(Debug, Clone)]
pub struct FlowStep {
    id: String,
    prompt: Prompt,
    expected_input: InputKind,
    validator: Option<Validator>,
    error_message: Option<String>,
    save_as: Option<String>,
    next: NextStep,
    transfer_to_agent: bool,
}

impl FlowStep {
    pub fn new(id: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            id: id.into(),
            prompt,
            expected_input: InputKind::Any,
            validator: None,
            error_message: None,
            save_as: None,
            next: NextStep::Fixed(StepTarget::Complete),
            transfer_to_agent: false,
        }
    }

    pub fn with_expected_input(mut self, kind: InputKind) -> Self {
        self.expected_input = kind;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }

    pub fn with_next(mut self, next: NextStep) -> Self {
        self.next = next;
        self
    }

    pub fn with_fixed_next(self, target: StepTarget) -> Self {
        self.with_next(NextStep::Fixed(target))
    }

    pub fn with_transfer_to_agent(mut self, transfer: bool) -> Self {
        self.transfer_to_agent = transfer;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn expected_input(&self) -> InputKind {
        self.expected_input
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn save_as(&self) -> Option<&str> {
        self.save_as.as_deref()
    }

    pub fn next(&self) -> &NextStep {
        &self.next
    }

    pub fn transfer_to_agent(&self) -> bool {
        self.transfer_to_agent
    }

    /// True when the input passes the validator, or no validator is set.
    pub fn validate(&self, input: &str) -> bool {
        self.validator.as_ref().map_or(true, |v| v.is_valid(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_accepts_every_kind() {
        assert!(InputKind::Any.accepts(InputKind::Text));
        assert!(InputKind::Any.accepts(InputKind::ButtonReply));
        assert!(InputKind::Any.accepts(InputKind::ListReply));
    }

    #[test]
    fn test_specific_kind_rejects_others() {
        assert!(InputKind::ButtonReply.accepts(InputKind::ButtonReply));
        assert!(!InputKind::ButtonReply.accepts(InputKind::Text));
        assert!(!InputKind::ListReply.accepts(InputKind::ButtonReply));
    }

    #[test]
    fn test_validate_without_validator_accepts_anything() {
        let step = FlowStep::new("ask", Prompt::Static(MessageContent::text("¿?")));
        assert!(step.validate(""));
        assert!(step.validate("cualquier cosa"));
    }

    #[test]
    fn test_pattern_validator() {
        let step = FlowStep::new("ask_order", Prompt::Static(MessageContent::text("Pedido?")))
            .with_validator(Validator::pattern(r"^\d{6}$").unwrap());
        assert!(step.validate("123456"));
        assert!(!step.validate("12345"));
        assert!(!step.validate("abc123"));
    }

    #[test]
    fn test_predicate_validator() {
        let step = FlowStep::new("ask_details", Prompt::Static(MessageContent::text("¿Qué pasó?")))
            .with_validator(Validator::predicate(|input| !input.trim().is_empty()));
        assert!(step.validate("se rompió"));
        assert!(!step.validate("   "));
    }

    #[test]
    fn test_resolve_exact_beats_wildcard_regardless_of_position() {
        let next = NextStep::conditional(
            vec![
                TransitionRule {
                    condition: Condition::Any,
                    target: StepTarget::Step("fallback".into()),
                },
                TransitionRule {
                    condition: Condition::Equals("confirm_yes".into()),
                    target: StepTarget::Transfer,
                },
            ],
            StepTarget::Complete,
        );
        assert_eq!(next.resolve("confirm_yes"), StepTarget::Transfer);
        assert_eq!(next.resolve("  confirm_yes  "), StepTarget::Transfer);
        assert_eq!(next.resolve("anything else"), StepTarget::Step("fallback".into()));
    }

    #[test]
    fn test_resolve_falls_back_to_default_without_wildcard() {
        let next = NextStep::conditional(
            vec![TransitionRule {
                condition: Condition::Equals("confirm_no".into()),
                target: StepTarget::Step("cancelled".into()),
            }],
            StepTarget::Complete,
        );
        assert_eq!(next.resolve("confirm_no"), StepTarget::Step("cancelled".into()));
        assert_eq!(next.resolve("dunno"), StepTarget::Complete);
    }

    #[test]
    fn test_step_targets_lists_reachable_ids() {
        let next = NextStep::conditional(
            vec![
                TransitionRule {
                    condition: Condition::Equals("a".into()),
                    target: StepTarget::Step("left".into()),
                },
                TransitionRule {
                    condition: Condition::Any,
                    target: StepTarget::SwitchFlow("menu".into()),
                },
            ],
            StepTarget::Step("right".into()),
        );
        assert_eq!(next.step_targets(), vec!["left", "right"]);
    }
}
