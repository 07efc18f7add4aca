//! Owned sync instance: one socket, many subscribers.

use std::sync::Arc;

use task_sync::{ConversationTurn, Envelope, UnifiedMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::SyncConfig;
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::Result;
use crate::source::{ConversationSource, HttpConversationSource};
use crate::store::ConversationStore;
use crate::subscription::{EventHandler, SubscriptionFilter, SubscriptionRegistry};
use crate::transport::{Connector, WsConnector};

/// Created once with [`TaskSync::init`] and handed to consumers; torn down
/// with [`TaskSync::shutdown`]. Must be created inside a tokio runtime.
pub struct TaskSync {
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionManager,
    store: ConversationStore,
    store_subscription: String,
    dispatcher: JoinHandle<()>,
    store_listener: JoinHandle<()>,
}

impl TaskSync {
    pub fn init(
        config: &SyncConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn ConversationSource>,
    ) -> Result<Self> {
        config.validate()?;
        let url = config.socket_url()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = registry.spawn_dispatcher(events_rx);
        let connection =
            ConnectionManager::new(url, ConnectionConfig::from(config), connector, events_tx)?;
        let store = ConversationStore::new(source, config.completion_expiry);
        let (store_subscription, store_listener) = store.attach(&registry);

        info!("task sync initialized for {}", connection.url());
        Ok(Self {
            registry,
            connection,
            store,
            store_subscription,
            dispatcher,
            store_listener,
        })
    }

    /// WebSocket transport and HTTP conversation source from `config`.
    pub fn with_defaults(config: &SyncConfig) -> Result<Self> {
        let source = HttpConversationSource::new(config)?;
        Self::init(config, Arc::new(WsConnector), Arc::new(source))
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn subscribe(&self, handler: EventHandler, filter: SubscriptionFilter) -> String {
        self.registry.subscribe(handler, filter)
    }

    pub fn subscribe_channel(&self, filter: SubscriptionFilter) -> (String, mpsc::Receiver<Envelope>) {
        self.registry.subscribe_channel(filter)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.registry.unsubscribe(subscription_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    /// Fetch persisted records for `task_id`. Works while offline.
    pub async fn load_conversation(&self, task_id: &str) -> Result<Vec<UnifiedMessage>> {
        self.store.load(task_id).await
    }

    pub fn get_unified_conversation(&self, task_id: &str) -> Vec<UnifiedMessage> {
        self.store.get_unified_conversation(task_id)
    }

    pub fn get_turns(&self, task_id: &str) -> Vec<ConversationTurn> {
        self.store.get_turns(task_id)
    }

    /// Receiver bumped whenever a conversation view may have changed.
    pub fn conversation_changes(&self) -> watch::Receiver<u64> {
        self.store.changes()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Close the socket and stop every background task.
    pub async fn shutdown(self) {
        self.connection.disconnect().await;
        self.registry.unsubscribe(&self.store_subscription);
        self.store_listener.abort();
        self.dispatcher.abort();
        self.store.shutdown();
        info!("task sync shut down");
    }
}
