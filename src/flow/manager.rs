use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::flow::graph::Flow;
use crate::flow::state::{ConversationState, FlowData};
use crate::flow::step::{InputKind, StepTarget};
use crate::message::{MessageContent, OutboundMessage};

/// Command words that abort whatever flow is in progress. Matched against the
/// first whitespace token of the normalized input, so trailing free text
/// ("cancelar todo") still counts.
pub const CANCEL_COMMANDS: &[&str] = &[
    "cancelar", "salir", "volver", "atras", "atrás", "menu", "menú",
];

/// Engine-level texts sent when no step prompt applies.
#[derive(Debug, Clone)]
pub struct EngineMessages {
    /// Sent when a flow runs to its natural end.
    pub completion: String,
    /// Sent when the conversation is handed to a human agent.
    pub handoff: String,
    /// Returned by [`FlowManager::cancel_flow`].
    pub cancelled: String,
    /// Fallback when a step fails validation and has no error text of its own.
    pub invalid_input: String,
}

impl Default for EngineMessages {
    fn default() -> Self {
        Self {
            completion: "¡Listo! Terminamos por acá. Escribí *menú* si necesitás algo más.".into(),
            handoff: "Perfecto, te derivamos con un agente. En breve una persona del equipo sigue la conversación.".into(),
            cancelled: "Listo, cancelamos la operación. Escribí *menú* para empezar de nuevo.".into(),
            invalid_input: "No entendimos tu respuesta. Probá de nuevo, por favor.".into(),
        }
    }
}

/// Outcome of one engine call: the message to send and the state to persist.
/// On completion, cancellation or hand-off the returned state is inactive and
/// the caller must clear its stored record.
#[derive(Debug, Clone)]
pub struct FlowTurn {
    pub message: OutboundMessage,
    pub state: ConversationState,
    pub completed: bool,
    pub transfer_to_agent: bool,
}

impl FlowTurn {
    fn advance(message: OutboundMessage, state: ConversationState) -> Self {
        Self {
            message,
            state,
            completed: false,
            transfer_to_agent: false,
        }
    }

    fn completed(message: OutboundMessage) -> Self {
        Self {
            message,
            state: ConversationState::inactive(),
            completed: true,
            transfer_to_agent: false,
        }
    }

    fn transferred(message: OutboundMessage) -> Self {
        Self {
            message,
            state: ConversationState::inactive(),
            completed: true,
            transfer_to_agent: true,
        }
    }
}

/// Registry of flows plus the per-turn interpreter. One instance serves every
/// conversation; per-conversation position lives entirely in the state the
/// caller passes in.
#[derive(Debug)]
pub struct FlowManager {
    flows: DashMap<String, Arc<Flow>>,
    messages: EngineMessages,
}

impl FlowManager {
    pub fn new() -> Arc<Self> {
        Self::with_messages(EngineMessages::default())
    }

    pub fn with_messages(messages: EngineMessages) -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            messages,
        })
    }

    /// Inserts a flow under its type key, replacing any previous registration.
    pub fn register_flow(&self, flow_type: impl Into<String>, flow: Flow) {
        let flow_type = flow_type.into();
        self.flows.insert(flow_type.clone(), Arc::new(flow));
        info!("Registered flow: {}", flow_type);
    }

    pub fn flow(&self, flow_type: &str) -> Option<Arc<Flow>> {
        self.flows.get(flow_type).map(|entry| entry.value().clone())
    }

    pub fn flow_types(&self) -> Vec<String> {
        self.flows.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn remove_flow(&self, flow_type: &str) {
        self.flows.remove(flow_type);
        info!("Removed flow: {}", flow_type);
    }

    /// Whether the stored position still counts as an in-progress flow:
    /// flow and step recorded, the flow registered, and the start timestamp
    /// within that flow's timeout. Stale state is only reported, never
    /// cleared here.
    pub fn has_active_flow(&self, state: &ConversationState) -> bool {
        self.has_active_flow_at(state, Utc::now())
    }

    pub fn has_active_flow_at(&self, state: &ConversationState, now: DateTime<Utc>) -> bool {
        let Some(flow_type) = state.flow_type.as_deref() else {
            return false;
        };
        let Some(flow) = self.flow(flow_type) else {
            return false;
        };
        state.is_active_at(flow.timeout_minutes(), now)
    }

    /// True when the input starts with one of [`CANCEL_COMMANDS`].
    pub fn is_cancel_command(input: &str) -> bool {
        let normalized = input.trim().to_lowercase();
        normalized
            .split_whitespace()
            .next()
            .map(|first| CANCEL_COMMANDS.contains(&first))
            .unwrap_or(false)
    }

    /// Cancellation acknowledgement. Clearing the stored state is the
    /// caller's job; this only produces the message.
    pub fn cancel_flow(&self, recipient: &str) -> OutboundMessage {
        OutboundMessage::new(recipient, MessageContent::text(self.messages.cancelled.clone()))
    }

    /// Starts `flow_type` at its initial step with an empty data bag.
    /// An unregistered type yields `Ok(None)`.
    pub async fn start_flow(
        &self,
        flow_type: &str,
        recipient: &str,
    ) -> anyhow::Result<Option<FlowTurn>> {
        let Some(flow) = self.flow(flow_type) else {
            warn!("start requested for unregistered flow `{}`", flow_type);
            return Ok(None);
        };
        let data = FlowData::new();
        let initial = flow.initial_step();
        let message = flow.message_for_step(initial, recipient, &data).await?;
        let state = ConversationState::started(flow_type, initial.id(), data, Utc::now());
        Ok(Some(FlowTurn::advance(message, state)))
    }

    /// Advances the conversation one turn.
    ///
    /// Configuration holes (unknown flow, missing step) come back as
    /// `Ok(None)` so the caller can fall back and repair its stored state.
    /// Wrong input kind and failed validation re-prompt without touching the
    /// state. Dynamic-prompt lookup failures propagate as errors.
    pub async fn process_input(
        &self,
        state: &ConversationState,
        input: &str,
        kind: InputKind,
        recipient: &str,
    ) -> anyhow::Result<Option<FlowTurn>> {
        let Some(flow_type) = state.flow_type.as_deref() else {
            warn!("process_input called without a flow type");
            return Ok(None);
        };
        let Some(flow) = self.flow(flow_type) else {
            warn!("conversation references unregistered flow `{}`", flow_type);
            return Ok(None);
        };
        let Some(step_id) = state.flow_step.as_deref() else {
            warn!("conversation in flow `{}` has no current step", flow_type);
            return Ok(None);
        };
        let Some(step) = flow.step(step_id) else {
            warn!("flow `{}` has no step `{}`; stored state needs repair", flow_type, step_id);
            return Ok(None);
        };

        // Typed instead of tapped (or the other way around): repeat the
        // question as-is, keeping whatever progress was made.
        if !step.expected_input().accepts(kind) {
            let message = flow.message_for_step(step, recipient, &state.flow_data).await?;
            return Ok(Some(FlowTurn::advance(message, state.clone())));
        }

        if !flow.validate_input(step, input) {
            let error_text = step
                .error_message()
                .unwrap_or(self.messages.invalid_input.as_str());
            let base = flow.message_for_step(step, recipient, &state.flow_data).await?;
            let message = OutboundMessage::new(
                recipient,
                base.into_content().with_body_prefix(error_text),
            );
            return Ok(Some(FlowTurn::advance(message, state.clone())));
        }

        let new_data = match step.save_as() {
            Some(key) => state.flow_data.with(key, input),
            None => state.flow_data.clone(),
        };

        let target = flow.next_target(step, input);
        debug!(
            "`{}` at `{}` routed to {:?}",
            flow_type,
            step.id(),
            target
        );
        match target {
            StepTarget::Complete => {
                let message = OutboundMessage::new(
                    recipient,
                    MessageContent::text(self.messages.completion.clone()),
                );
                Ok(Some(FlowTurn::completed(message)))
            }
            StepTarget::Transfer => {
                let message = OutboundMessage::new(
                    recipient,
                    MessageContent::text(self.messages.handoff.clone()),
                );
                Ok(Some(FlowTurn::transferred(message)))
            }
            StepTarget::SwitchFlow(code) => {
                let Some(next_flow) = self.flow(&code) else {
                    warn!(
                        "flow `{}` step `{}` switches to unregistered flow `{}`",
                        flow_type, step_id, code
                    );
                    return Ok(None);
                };
                let carried = new_data.carried_from(flow_type);
                let initial = next_flow.initial_step();
                let message = next_flow.message_for_step(initial, recipient, &carried).await?;
                let new_state =
                    ConversationState::started(&code, initial.id(), carried, Utc::now());
                info!("conversation switched from flow `{}` to `{}`", flow_type, code);
                Ok(Some(FlowTurn::advance(message, new_state)))
            }
            StepTarget::Step(next_id) => {
                let Some(next_step) = flow.step(&next_id) else {
                    warn!("flow `{}` resolved unknown step `{}`", flow_type, next_id);
                    return Ok(None);
                };
                let message = flow.message_for_step(next_step, recipient, &new_data).await?;
                if next_step.transfer_to_agent() {
                    Ok(Some(FlowTurn::transferred(message)))
                } else {
                    Ok(Some(FlowTurn::advance(
                        message,
                        state.at_step(next_step.id(), new_data),
                    )))
                }
            }
        }
    }
}
