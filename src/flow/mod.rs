pub mod catalog;
pub mod definition;
pub mod graph;
pub mod loader;
pub mod manager;
pub mod session;
pub mod state;
pub mod step;

mod flow_test;

pub use graph::{DEFAULT_TIMEOUT_MINUTES, Flow, FlowBuilder, FlowConfigError};
pub use manager::{EngineMessages, FlowManager, FlowTurn};
pub use session::{InMemoryStateStore, StateStore, StateStoreType};
pub use state::{ConversationState, FlowData};
pub use step::{InputKind, StepTarget};
