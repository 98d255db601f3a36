use std::sync::Arc;

use async_trait::async_trait;

use crate::flow::graph::{Flow, FlowConfigError};
use crate::flow::loader::{DataItem, DataSourceType};
use crate::flow::manager::FlowManager;
use crate::flow::state::FlowData;
use crate::flow::step::{
    Condition, FlowStep, InputKind, NextStep, Prompt, StepTarget, TransitionRule, Validator,
};
use crate::message::{
    ButtonContent, ButtonOption, ListContent, ListRow, ListSection, MessageContent,
};

pub const MENU_FLOW: &str = "menu";
pub const CLAIMS_FLOW: &str = "claims";
pub const STORES_FLOW: &str = "stores";

/// Name the store lookup is registered under for dynamic steps.
pub const STORES_SOURCE: &str = "stores_by_zone";

/// Registers the flows that ship compiled in. The stores flow is not here,
/// it loads from the definitions directory like any admin-deployed flow.
pub fn register_builtin_flows(manager: &FlowManager) -> Result<(), FlowConfigError> {
    manager.register_flow(MENU_FLOW, menu_flow()?);
    manager.register_flow(CLAIMS_FLOW, claims_flow()?);
    Ok(())
}

/// Entry menu: a picker list routing into the other flows.
pub fn menu_flow() -> Result<Flow, FlowConfigError> {
    let main_menu = MessageContent::List(ListContent::new(
        "¡Hola! ¿En qué te podemos ayudar?",
        "Ver opciones",
        vec![ListSection::new(
            "Opciones",
            vec![
                ListRow::new("opt_claim", "Registrar un reclamo")
                    .with_description("Problemas con un pedido"),
                ListRow::new("opt_store", "Sucursales")
                    .with_description("Encontrá la más cercana"),
                ListRow::new("opt_hours", "Horarios de atención"),
            ],
        )],
    ));

    Flow::builder("Menú principal")
        .description("Punto de entrada de la conversación")
        .step(
            FlowStep::new("main", Prompt::Static(main_menu))
                .with_expected_input(InputKind::ListReply)
                .with_next(NextStep::conditional(
                    vec![
                        TransitionRule {
                            condition: Condition::Equals("opt_claim".into()),
                            target: StepTarget::SwitchFlow(CLAIMS_FLOW.into()),
                        },
                        TransitionRule {
                            condition: Condition::Equals("opt_store".into()),
                            target: StepTarget::SwitchFlow(STORES_FLOW.into()),
                        },
                        TransitionRule {
                            condition: Condition::Equals("opt_hours".into()),
                            target: StepTarget::Step("hours".into()),
                        },
                    ],
                    StepTarget::Step("main".into()),
                )),
        )
        .step(
            FlowStep::new(
                "hours",
                Prompt::Static(MessageContent::text(
                    "Atendemos de lunes a viernes de 9 a 18 hs y sábados de 9 a 13 hs.",
                )),
            )
            .with_fixed_next(StepTarget::Complete),
        )
        .build()
}

/// Claim intake: category, description, order number, confirmation, and the
/// hand-off to a human agent.
pub fn claims_flow() -> Result<Flow, FlowConfigError> {
    let order_validator =
        Validator::pattern(r"^\d{6}$").map_err(|source| FlowConfigError::InvalidPattern {
            step: "ask_order".into(),
            source,
        })?;

    let categories = MessageContent::List(ListContent::new(
        "Lamentamos el inconveniente. ¿Sobre qué producto es el reclamo?",
        "Elegir categoría",
        vec![ListSection::new(
            "Categorías",
            vec![
                ListRow::new("cat_ceramico", "Cerámicos")
                    .with_description("Pisos y revestimientos"),
                ListRow::new("cat_sanitario", "Sanitarios"),
                ListRow::new("cat_griferia", "Grifería"),
            ],
        )],
    ));

    let confirm = MessageContent::Buttons(
        ButtonContent::new(
            "Vamos a registrar un reclamo por el pedido {{order_number}}. ¿Confirmás?",
            vec![
                ButtonOption::new("confirm_yes", "Sí, confirmar"),
                ButtonOption::new("confirm_no", "No, cancelar"),
            ],
        )
        .with_footer("Podés escribir *cancelar* en cualquier momento"),
    );

    Flow::builder("Reclamos")
        .description("Registro de reclamos con derivación a posventa")
        .step(
            FlowStep::new("select_category", Prompt::Static(categories))
                .with_expected_input(InputKind::ListReply)
                .with_save_as("category")
                .with_fixed_next(StepTarget::Step("ask_details".into())),
        )
        .step(
            FlowStep::new(
                "ask_details",
                Prompt::Static(MessageContent::text(
                    "Contanos qué pasó con el producto.",
                )),
            )
            .with_expected_input(InputKind::Text)
            .with_validator(Validator::predicate(|input| !input.trim().is_empty()))
            .with_error_message("Necesitamos una breve descripción para avanzar.")
            .with_save_as("details")
            .with_fixed_next(StepTarget::Step("ask_order".into())),
        )
        .step(
            FlowStep::new(
                "ask_order",
                Prompt::Static(MessageContent::text(
                    "¿Cuál es el número de pedido? Son 6 dígitos y figura en el comprobante.",
                )),
            )
            .with_expected_input(InputKind::Text)
            .with_validator(order_validator)
            .with_error_message("El número de pedido tiene 6 dígitos, por ejemplo 123456.")
            .with_save_as("order_number")
            .with_fixed_next(StepTarget::Step("confirm".into())),
        )
        .step(
            FlowStep::new("confirm", Prompt::Static(confirm))
                .with_expected_input(InputKind::ButtonReply)
                .with_next(NextStep::conditional(
                    vec![
                        TransitionRule {
                            condition: Condition::Equals("confirm_yes".into()),
                            target: StepTarget::Step("transfer".into()),
                        },
                        TransitionRule {
                            condition: Condition::Equals("confirm_no".into()),
                            target: StepTarget::Step("cancelled".into()),
                        },
                    ],
                    StepTarget::Step("confirm".into()),
                )),
        )
        .step(
            FlowStep::new(
                "transfer",
                Prompt::Static(MessageContent::text(
                    "Ya registramos el reclamo por el pedido {{order_number}}. Te derivamos con el equipo de posventa.",
                )),
            )
            .with_transfer_to_agent(true),
        )
        .step(
            FlowStep::new(
                "cancelled",
                Prompt::Static(MessageContent::text(
                    "Listo, no registramos el reclamo. Escribí *menú* si necesitás otra cosa.",
                )),
            )
            .with_fixed_next(StepTarget::Complete),
        )
        .build()
}

/// In-memory store lookup for the stores flow. A real deployment would put a
/// database client behind the same trait.
pub struct StoreDirectory {
    stores: Vec<StoreRecord>,
}

struct StoreRecord {
    zone: &'static str,
    id: &'static str,
    name: &'static str,
    address: &'static str,
}

impl StoreDirectory {
    pub fn sample() -> Arc<Self> {
        Arc::new(Self {
            stores: vec![
                StoreRecord {
                    zone: "zone_center",
                    id: "store_centro",
                    name: "Casa Central",
                    address: "Av. Corrientes 1500",
                },
                StoreRecord {
                    zone: "zone_center",
                    id: "store_congreso",
                    name: "Sucursal Congreso",
                    address: "Av. Callao 350",
                },
                StoreRecord {
                    zone: "zone_north",
                    id: "store_belgrano",
                    name: "Sucursal Belgrano",
                    address: "Av. Cabildo 2200",
                },
                StoreRecord {
                    zone: "zone_west",
                    id: "store_caballito",
                    name: "Sucursal Caballito",
                    address: "Av. Rivadavia 5000",
                },
            ],
        })
    }
}

#[async_trait]
impl DataSourceType for StoreDirectory {
    async fn fetch(&self, data: &FlowData) -> anyhow::Result<Vec<DataItem>> {
        let zone = data.get("zone");
        Ok(self
            .stores
            .iter()
            .filter(|s| zone.map_or(true, |z| s.zone == z))
            .map(|s| DataItem::new(s.id, s.name).with_description(s.address))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_flows_assemble() {
        let manager = FlowManager::new();
        register_builtin_flows(&manager).unwrap();
        let mut registered = manager.flow_types();
        registered.sort();
        assert_eq!(registered, vec!["claims".to_string(), "menu".to_string()]);
    }

    #[test]
    fn test_claims_flow_starts_at_category_selection() {
        let flow = claims_flow().unwrap();
        assert_eq!(flow.initial_step().id(), "select_category");
        assert_eq!(flow.initial_step().expected_input(), InputKind::ListReply);
        assert!(flow.has_step("transfer"));
        assert!(flow.step("transfer").unwrap().transfer_to_agent());
    }

    #[test]
    fn test_menu_routes_to_other_flows() {
        let flow = menu_flow().unwrap();
        let main = flow.initial_step();
        assert_eq!(
            flow.next_target(main, "opt_claim"),
            StepTarget::SwitchFlow(CLAIMS_FLOW.into())
        );
        assert_eq!(
            flow.next_target(main, "opt_store"),
            StepTarget::SwitchFlow(STORES_FLOW.into())
        );
        assert_eq!(
            flow.next_target(main, "opt_hours"),
            StepTarget::Step("hours".into())
        );
        // anything unexpected re-offers the menu
        assert_eq!(flow.next_target(main, "opt_nope"), StepTarget::Step("main".into()));
    }

    #[tokio::test]
    async fn test_store_directory_filters_by_zone() {
        let directory = StoreDirectory::sample();
        let data = FlowData::new().with("zone", "zone_center");
        let items = directory.fetch(&data).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.id.starts_with("store_")));

        // without a chosen zone every store comes back
        let all = directory.fetch(&FlowData::new()).await.unwrap();
        assert_eq!(all.len(), 4);
    }
}
