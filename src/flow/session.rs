use crate::flow::state::ConversationState;
use async_trait::async_trait;
use moka::future::Cache;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type StateStore = Arc<dyn StateStoreType>;

/// Persistence seam for per-conversation flow state, keyed by the channel's
/// conversation id (the phone number, in practice). Production deployments
/// back this with their own storage; the engine only needs load/save/clear.
#[async_trait]
pub trait StateStoreType: Send + Sync + Debug {
    /// Returns the stored state, if any.
    async fn load(&self, conversation_id: &str) -> Option<ConversationState>;

    /// Replaces the stored state for this conversation.
    async fn save(&self, conversation_id: &str, state: ConversationState);

    /// Drops the stored state (completion, cancellation, hand-off).
    async fn clear(&self, conversation_id: &str);
}

/// In-memory store with idle expiry. The expiry is memory hygiene only; flow
/// staleness is always re-derived from `flowStartedAt` on each turn.
#[derive(Clone, Debug)]
pub struct InMemoryStateStore {
    cache: Cache<String, ConversationState>,
}

impl InMemoryStateStore {
    /// Creates a store whose entries are dropped after `ttl_secs` of idleness.
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value: ConversationState, cause| {
                info!("Conversation state expired: key={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl StateStoreType for InMemoryStateStore {
    async fn load(&self, conversation_id: &str) -> Option<ConversationState> {
        self.cache.get(conversation_id).await
    }

    async fn save(&self, conversation_id: &str, state: ConversationState) {
        self.cache.insert(conversation_id.to_string(), state).await;
    }

    async fn clear(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id).await;
    }
}
