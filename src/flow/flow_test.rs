#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use crate::flow::catalog::register_builtin_flows;
    use crate::flow::graph::Flow;
    use crate::flow::manager::{EngineMessages, FlowManager};
    use crate::flow::session::{InMemoryStateStore, StateStoreType};
    use crate::flow::state::{ConversationState, FlowData};
    use crate::flow::step::{
        FlowStep, InputKind, Prompt, PromptResolverType, StepTarget, Validator,
    };
    use crate::message::MessageContent;

    const RECIPIENT: &str = "5491134567890";

    fn manager_with_builtins() -> Arc<FlowManager> {
        let manager = FlowManager::new();
        register_builtin_flows(&manager).unwrap();
        manager
    }

    fn state_at(flow: &str, step: &str, data: FlowData) -> ConversationState {
        ConversationState::started(flow, step, data, Utc::now())
    }

    fn text_step(id: &str, body: &str) -> FlowStep {
        FlowStep::new(id, Prompt::Static(MessageContent::text(body)))
    }

    #[tokio::test]
    async fn test_start_flow_renders_initial_step() {
        let manager = manager_with_builtins();
        let turn = manager
            .start_flow("claims", RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_type.as_deref(), Some("claims"));
        assert_eq!(turn.state.flow_step.as_deref(), Some("select_category"));
        assert!(turn.state.flow_started_at.is_some());
        assert!(!turn.completed);
        assert!(!turn.transfer_to_agent);
        assert_eq!(turn.message.to(), RECIPIENT);
        assert!(matches!(turn.message.content(), MessageContent::List(_)));
    }

    #[tokio::test]
    async fn test_start_unregistered_flow_returns_none() {
        let manager = manager_with_builtins();
        let turn = manager.start_flow("ghost", RECIPIENT).await.unwrap();
        assert!(turn.is_none());
    }

    #[tokio::test]
    async fn test_wrong_input_kind_reprompts_without_saving() {
        let manager = manager_with_builtins();
        let state = state_at("claims", "select_category", FlowData::new());

        // plain text at a list step: re-offer the list, keep the state as is
        let turn = manager
            .process_input(&state, "quiero cerámicos", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_step.as_deref(), Some("select_category"));
        assert!(!turn.state.flow_data.contains_key("category"));
        assert!(matches!(turn.message.content(), MessageContent::List(_)));
        assert!(!turn.completed);
    }

    #[tokio::test]
    async fn test_informational_step_accepts_no_input() {
        let manager = manager_with_builtins();
        let flow = Flow::builder("Aviso")
            .step(text_step("notice", "Estamos en mantenimiento.").with_expected_input(InputKind::None))
            .build()
            .unwrap();
        manager.register_flow("notice", flow);

        let state = state_at("notice", "notice", FlowData::new());
        let turn = manager
            .process_input(&state, "hola", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.state.flow_step.as_deref(), Some("notice"));
        assert_eq!(turn.message.text(), "Estamos en mantenimiento.");
    }

    #[tokio::test]
    async fn test_category_selection_saves_and_advances() {
        let manager = manager_with_builtins();
        let state = state_at("claims", "select_category", FlowData::new());

        let turn = manager
            .process_input(&state, "cat_ceramico", InputKind::ListReply, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_step.as_deref(), Some("ask_details"));
        assert_eq!(turn.state.flow_data.get("category"), Some("cat_ceramico"));
        assert_eq!(turn.message.text(), "Contanos qué pasó con el producto.");
        assert!(!turn.completed);
    }

    #[tokio::test]
    async fn test_validation_failure_reprompts_with_error() {
        let manager = manager_with_builtins();
        let data = FlowData::new()
            .with("category", "cat_ceramico")
            .with("details", "llegaron partidas");
        let state = state_at("claims", "ask_order", data);

        let turn = manager
            .process_input(&state, "12ab", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert!(
            turn.message
                .text()
                .starts_with("El número de pedido tiene 6 dígitos")
        );
        assert!(turn.message.text().contains("¿Cuál es el número de pedido?"));
        assert_eq!(turn.state.flow_step.as_deref(), Some("ask_order"));
        assert!(!turn.state.flow_data.contains_key("order_number"));
    }

    #[tokio::test]
    async fn test_validation_failures_reprompt_without_limit() {
        let manager = manager_with_builtins();
        let data = FlowData::new()
            .with("category", "cat_ceramico")
            .with("details", "llegaron partidas");
        let mut state = state_at("claims", "ask_order", data);

        // no retry cap: every failure re-prompts and leaves the state as is
        for _ in 0..5 {
            let turn = manager
                .process_input(&state, "12ab", InputKind::Text, RECIPIENT)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(turn.state, state);
            assert!(!turn.completed);
            assert!(
                turn.message
                    .text()
                    .starts_with("El número de pedido tiene 6 dígitos")
            );
            state = turn.state;
        }

        let turn = manager
            .process_input(&state, "482913", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.state.flow_step.as_deref(), Some("confirm"));
    }

    #[tokio::test]
    async fn test_validation_fallback_message_when_step_has_none() {
        let manager = manager_with_builtins();
        let flow = Flow::builder("Guardado")
            .step(
                text_step("only", "¿Cuántos metros necesitás?")
                    .with_validator(Validator::pattern(r"^\d+$").unwrap()),
            )
            .build()
            .unwrap();
        manager.register_flow("guard", flow);

        let state = state_at("guard", "only", FlowData::new());
        let turn = manager
            .process_input(&state, "muchos", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert!(
            turn.message
                .text()
                .starts_with(&EngineMessages::default().invalid_input)
        );
    }

    #[tokio::test]
    async fn test_flow_completion_clears_state() {
        let manager = manager_with_builtins();
        let state = state_at("menu", "main", FlowData::new());

        let turn = manager
            .process_input(&state, "opt_hours", InputKind::ListReply, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.state.flow_step.as_deref(), Some("hours"));
        assert!(turn.message.text().contains("lunes a viernes"));

        let turn = manager
            .process_input(&turn.state, "gracias", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert!(turn.completed);
        assert!(!turn.transfer_to_agent);
        assert!(!turn.state.is_in_flow());
        assert_eq!(turn.message.text(), EngineMessages::default().completion);
    }

    #[tokio::test]
    async fn test_confirm_yes_hands_off_with_interpolated_text() {
        let manager = manager_with_builtins();
        let data = FlowData::new()
            .with("category", "cat_griferia")
            .with("details", "pérdida en la unión")
            .with("order_number", "482913");
        let state = state_at("claims", "confirm", data);

        let turn = manager
            .process_input(&state, "confirm_yes", InputKind::ButtonReply, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert!(turn.completed);
        assert!(turn.transfer_to_agent);
        assert!(!turn.state.is_in_flow());
        assert!(turn.message.text().contains("482913"));
    }

    #[tokio::test]
    async fn test_confirm_no_routes_to_cancelled_step() {
        let manager = manager_with_builtins();
        let data = FlowData::new().with("order_number", "482913");
        let state = state_at("claims", "confirm", data);

        let turn = manager
            .process_input(&state, "confirm_no", InputKind::ButtonReply, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_step.as_deref(), Some("cancelled"));
        assert!(!turn.completed);
        assert!(!turn.transfer_to_agent);
        assert!(turn.message.text().starts_with("Listo, no registramos el reclamo"));
    }

    #[tokio::test]
    async fn test_unknown_button_falls_back_to_reprompt() {
        let manager = manager_with_builtins();
        let data = FlowData::new().with("order_number", "482913");
        let state = state_at("claims", "confirm", data);

        let turn = manager
            .process_input(&state, "confirm_later", InputKind::ButtonReply, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_step.as_deref(), Some("confirm"));
        assert!(matches!(turn.message.content(), MessageContent::Buttons(_)));
        assert!(turn.message.text().contains("482913"));
    }

    #[tokio::test]
    async fn test_fixed_transfer_target_uses_handoff_text() {
        let manager = manager_with_builtins();
        let flow = Flow::builder("Directo")
            .step(text_step("only", "¿Hablamos con una persona?").with_fixed_next(StepTarget::Transfer))
            .build()
            .unwrap();
        manager.register_flow("direct", flow);

        let state = state_at("direct", "only", FlowData::new());
        let turn = manager
            .process_input(&state, "sí", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert!(turn.completed);
        assert!(turn.transfer_to_agent);
        assert_eq!(turn.message.text(), EngineMessages::default().handoff);
    }

    #[tokio::test]
    async fn test_switch_flow_carries_data_and_resets_clock() {
        let manager = manager_with_builtins();
        let triage = Flow::builder("Triage")
            .step(
                text_step("ask_topic", "¿Sobre qué tema escribís?")
                    .with_save_as("topic")
                    .with_fixed_next(StepTarget::SwitchFlow("claims".into())),
            )
            .build()
            .unwrap();
        manager.register_flow("triage", triage);

        let before = Utc::now() - Duration::minutes(10);
        let state = ConversationState::started("triage", "ask_topic", FlowData::new(), before);

        let turn = manager
            .process_input(&state, "pintura", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(turn.state.flow_type.as_deref(), Some("claims"));
        assert_eq!(turn.state.flow_step.as_deref(), Some("select_category"));
        assert_eq!(turn.state.flow_data.get("topic"), Some("pintura"));
        assert_eq!(turn.state.flow_data.from_flow(), Some("triage"));
        assert!(turn.state.flow_started_at.unwrap() > before);
        assert!(matches!(turn.message.content(), MessageContent::List(_)));
    }

    #[tokio::test]
    async fn test_switch_to_unregistered_flow_returns_none() {
        let manager = manager_with_builtins();
        let lost = Flow::builder("Perdido")
            .step(text_step("only", "¿Seguimos?").with_fixed_next(StepTarget::SwitchFlow("ghost".into())))
            .build()
            .unwrap();
        manager.register_flow("lost", lost);

        let state = state_at("lost", "only", FlowData::new());
        let turn = manager
            .process_input(&state, "dale", InputKind::Text, RECIPIENT)
            .await
            .unwrap();
        assert!(turn.is_none());
    }

    #[tokio::test]
    async fn test_process_input_with_broken_state_returns_none() {
        let manager = manager_with_builtins();

        let inactive = ConversationState::inactive();
        assert!(
            manager
                .process_input(&inactive, "hola", InputKind::Text, RECIPIENT)
                .await
                .unwrap()
                .is_none()
        );

        let unknown_flow = state_at("ghost", "x", FlowData::new());
        assert!(
            manager
                .process_input(&unknown_flow, "hola", InputKind::Text, RECIPIENT)
                .await
                .unwrap()
                .is_none()
        );

        let unknown_step = state_at("claims", "no_such_step", FlowData::new());
        assert!(
            manager
                .process_input(&unknown_step, "hola", InputKind::Text, RECIPIENT)
                .await
                .unwrap()
                .is_none()
        );

        let mut no_step = ConversationState::inactive();
        no_step.flow_type = Some("claims".into());
        assert!(
            manager
                .process_input(&no_step, "hola", InputKind::Text, RECIPIENT)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_has_active_flow_respects_timeout() {
        let manager = manager_with_builtins();
        let now = Utc::now();

        let at_limit = ConversationState::started(
            "claims",
            "select_category",
            FlowData::new(),
            now - Duration::minutes(30),
        );
        assert!(manager.has_active_flow_at(&at_limit, now));

        let stale = ConversationState::started(
            "claims",
            "select_category",
            FlowData::new(),
            now - Duration::minutes(31),
        );
        assert!(!manager.has_active_flow_at(&stale, now));

        assert!(!manager.has_active_flow_at(&ConversationState::inactive(), now));

        let unregistered = ConversationState::started("ghost", "x", FlowData::new(), now);
        assert!(!manager.has_active_flow_at(&unregistered, now));
    }

    #[tokio::test]
    async fn test_per_flow_timeout_override() {
        let manager = manager_with_builtins();
        let quick = Flow::builder("Encuesta corta")
            .timeout_minutes(5)
            .step(text_step("only", "¿Qué tal la atención?"))
            .build()
            .unwrap();
        manager.register_flow("survey", quick);

        let now = Utc::now();
        let state =
            ConversationState::started("survey", "only", FlowData::new(), now - Duration::minutes(6));
        assert!(!manager.has_active_flow_at(&state, now));

        let fresh =
            ConversationState::started("survey", "only", FlowData::new(), now - Duration::minutes(4));
        assert!(manager.has_active_flow_at(&fresh, now));
    }

    #[test]
    fn test_cancel_command_vocabulary() {
        for command in ["cancelar", "salir", "volver", "atras", "atrás", "menu", "menú"] {
            assert!(FlowManager::is_cancel_command(command), "{command}");
        }
        assert!(FlowManager::is_cancel_command("  CANCELAR  "));
        assert!(FlowManager::is_cancel_command("Menú"));
        assert!(FlowManager::is_cancel_command("cancelar todo por favor"));
        assert!(FlowManager::is_cancel_command("salir\nya mismo"));

        assert!(!FlowManager::is_cancel_command("quiero comprar"));
        assert!(!FlowManager::is_cancel_command("cancelarlo"));
        assert!(!FlowManager::is_cancel_command(""));
    }

    #[test]
    fn test_cancel_flow_is_stateless() {
        let manager = manager_with_builtins();
        let message = manager.cancel_flow(RECIPIENT);
        assert_eq!(message.to(), RECIPIENT);
        assert_eq!(message.text(), EngineMessages::default().cancelled);
    }

    #[tokio::test]
    async fn test_custom_engine_messages() {
        let manager = FlowManager::with_messages(EngineMessages {
            completion: "Gracias por escribirnos.".into(),
            ..Default::default()
        });
        let flow = Flow::builder("Corto")
            .step(text_step("only", "¿Todo bien?"))
            .build()
            .unwrap();
        manager.register_flow("short", flow);

        let state = state_at("short", "only", FlowData::new());
        let turn = manager
            .process_input(&state, "sí", InputKind::Text, RECIPIENT)
            .await
            .unwrap()
            .unwrap();
        assert!(turn.completed);
        assert_eq!(turn.message.text(), "Gracias por escribirnos.");
    }

    struct FailingLookup;

    #[async_trait]
    impl PromptResolverType for FailingLookup {
        async fn resolve(&self, _data: &FlowData) -> anyhow::Result<MessageContent> {
            anyhow::bail!("directory offline")
        }
    }

    #[tokio::test]
    async fn test_dynamic_prompt_failure_propagates() {
        let manager = manager_with_builtins();
        let flow = Flow::builder("Sucursales")
            .step(FlowStep::new("pick", Prompt::Dynamic(Arc::new(FailingLookup))))
            .build()
            .unwrap();
        manager.register_flow("stores_broken", flow);

        assert!(manager.start_flow("stores_broken", RECIPIENT).await.is_err());
    }

    #[tokio::test]
    async fn test_full_claim_conversation_through_store() {
        let manager = manager_with_builtins();
        let store = InMemoryStateStore::new(3600);
        let conversation = "5491122233344";

        let turn = manager
            .start_flow("claims", conversation)
            .await
            .unwrap()
            .unwrap();
        store.save(conversation, turn.state.clone()).await;

        let state = store.load(conversation).await.unwrap();
        let turn = manager
            .process_input(&state, "cat_ceramico", InputKind::ListReply, conversation)
            .await
            .unwrap()
            .unwrap();
        store.save(conversation, turn.state.clone()).await;

        let state = store.load(conversation).await.unwrap();
        let turn = manager
            .process_input(
                &state,
                "llegaron varias cajas partidas",
                InputKind::Text,
                conversation,
            )
            .await
            .unwrap()
            .unwrap();
        store.save(conversation, turn.state.clone()).await;

        let state = store.load(conversation).await.unwrap();
        let turn = manager
            .process_input(&state, "482913", InputKind::Text, conversation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.state.flow_step.as_deref(), Some("confirm"));
        assert!(turn.message.text().contains("482913"));
        store.save(conversation, turn.state.clone()).await;

        let state = store.load(conversation).await.unwrap();
        assert_eq!(state.flow_data.get("category"), Some("cat_ceramico"));
        assert_eq!(
            state.flow_data.get("details"),
            Some("llegaron varias cajas partidas")
        );

        let turn = manager
            .process_input(&state, "confirm_yes", InputKind::ButtonReply, conversation)
            .await
            .unwrap()
            .unwrap();
        assert!(turn.completed);
        assert!(turn.transfer_to_agent);

        store.clear(conversation).await;
        assert!(store.load(conversation).await.is_none());
    }
}
