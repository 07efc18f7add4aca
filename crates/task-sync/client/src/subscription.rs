//! Subscription registry and event fanout.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use task_sync::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Capacity of channel-backed subscriptions.
pub const CHANNEL_CAPACITY: usize = 1000;

/// Callback type for handling dispatched events.
pub type EventHandler = Arc<dyn Fn(Envelope) -> Result<()> + Send + Sync>;

/// Optional allow-lists. An absent list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub event_types: Option<HashSet<String>>,
    pub task_ids: Option<HashSet<String>>,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_types<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: Some(event_types.into_iter().map(Into::into).collect()),
            task_ids: None,
        }
    }

    pub fn with_task_ids<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_ids = Some(task_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Task filters only apply to events that carry a task id.
    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(event_types) = &self.event_types
            && !event_types.contains(&envelope.event_type)
        {
            return false;
        }
        if let (Some(task_ids), Some(task_id)) = (&self.task_ids, &envelope.task_id)
            && !task_ids.contains(task_id)
        {
            return false;
        }
        true
    }
}

/// A registered listener.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub filter: SubscriptionFilter,
    sequence: u64,
    callback: Option<EventHandler>,
    event_tx: Option<mpsc::Sender<Envelope>>,
}

impl Subscription {
    /// Handle a dispatched event.
    pub fn handle_event(&self, envelope: Envelope) -> Result<()> {
        if let Some(tx) = &self.event_tx {
            tx.try_send(envelope.clone()).map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => {
                    ClientError::Subscription("event channel full - consumer too slow".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => ClientError::ChannelClosed,
            })?;
        }

        if let Some(callback) = &self.callback {
            callback(envelope)?;
        }

        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    next_sequence: u64,
    subscriptions: HashMap<String, Subscription>,
}

/// In-memory table of listeners. Safe to mutate from inside a handler.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: EventHandler, filter: SubscriptionFilter) -> String {
        self.insert(filter, Some(handler), None)
    }

    /// Register a listener that receives events on a bounded channel.
    pub fn subscribe_channel(&self, filter: SubscriptionFilter) -> (String, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (self.insert(filter, None, Some(tx)), rx)
    }

    /// Returns whether the id was registered.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .remove(id)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in registration order.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|subscription| subscription.id)
            .collect()
    }

    /// Deliver one event to every matching listener.
    ///
    /// Works from a snapshot taken before the first handler runs; a listener
    /// removed by an earlier handler in the same pass is skipped.
    pub fn dispatch(&self, envelope: &Envelope) {
        for subscription in self.snapshot() {
            if !subscription.filter.matches(envelope) || !self.contains(&subscription.id) {
                continue;
            }
            match subscription.handle_event(envelope.clone()) {
                Ok(()) => {}
                Err(ClientError::ChannelClosed) => {
                    debug!(subscription_id = %subscription.id, "dropping closed subscription");
                    self.unsubscribe(&subscription.id);
                }
                Err(error) => {
                    warn!(
                        subscription_id = %subscription.id,
                        event_type = %envelope.event_type,
                        "subscription handler error: {}",
                        error
                    );
                }
            }
        }
    }

    /// Drain `events` on a separate task so handlers never run inside the
    /// socket read loop.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = events.recv().await {
                registry.dispatch(&envelope);
            }
        })
    }

    fn insert(
        &self,
        filter: SubscriptionFilter,
        callback: Option<EventHandler>,
        event_tx: Option<mpsc::Sender<Envelope>>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.saturating_add(1);
        state.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                filter,
                sequence,
                callback,
                event_tx,
            },
        );
        id
    }

    fn snapshot(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .values()
            .cloned()
            .collect();
        subscriptions.sort_by_key(|subscription| subscription.sequence);
        subscriptions
    }
}
