//! Live conversation store.
//!
//! Holds the streaming accumulator and the last persisted records per task,
//! and answers reconciled views on demand. A completed stream invalidates the
//! task's records and refetches them on a spawned task; until the refetch
//! lands, the completed entry stays visible as a pending-final message.
//!
//! Fetches of one task may overlap. Each carries a per-task generation and a
//! response is applied only if no newer one has been applied already.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use task_sync::{
    ConversationTurn, Envelope, FragmentOutcome, MESSAGE_STREAMING_EVENT_TYPE, PersistedMessage,
    StreamingAccumulator, StreamingFragment, UnifiedMessage, group_turns, merge_with_pending,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::source::ConversationSource;
use crate::subscription::{SubscriptionFilter, SubscriptionRegistry};

#[derive(Default)]
struct StoreState {
    accumulator: StreamingAccumulator,
    persisted: HashMap<String, Vec<PersistedMessage>>,
    generations: HashMap<String, Generation>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Generation {
    issued: u64,
    applied: u64,
}

/// Issued fetch: its generation and the completion mark at issue time.
#[derive(Debug, Clone, Copy)]
struct FetchTicket {
    generation: u64,
    mark: u64,
}

struct StoreInner {
    source: Arc<dyn ConversationSource>,
    state: RwLock<StoreState>,
    refetches: Mutex<JoinSet<()>>,
    revision: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(source: Arc<dyn ConversationSource>, completion_expiry: Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                source,
                state: RwLock::new(StoreState {
                    accumulator: StreamingAccumulator::new(completion_expiry),
                    ..StoreState::default()
                }),
                refetches: Mutex::new(JoinSet::new()),
                revision,
            }),
        }
    }

    /// Receiver bumped whenever any task's view may have changed.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Fetch and cache the persisted records for `task_id`.
    pub async fn load(&self, task_id: &str) -> Result<Vec<UnifiedMessage>> {
        let ticket = self.issue_fetch(task_id);
        let messages = self
            .inner
            .source
            .fetch_persisted_conversation(task_id)
            .await?;
        self.store_persisted(task_id, ticket, messages);
        Ok(self.get_unified_conversation(task_id))
    }

    pub fn has_persisted(&self, task_id: &str) -> bool {
        self.read().persisted.contains_key(task_id)
    }

    pub fn is_streaming(&self, message_id: &str) -> bool {
        self.read().accumulator.is_streaming(message_id)
    }

    pub fn is_completed(&self, message_id: &str) -> bool {
        self.read()
            .accumulator
            .is_completed(message_id, Instant::now().into_std())
    }

    pub fn get_unified_conversation(&self, task_id: &str) -> Vec<UnifiedMessage> {
        let state = self.read();
        let persisted = state
            .persisted
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        merge_with_pending(
            persisted,
            &state.accumulator.live_for_task(task_id),
            &state.accumulator.pending_final_for_task(task_id),
        )
    }

    pub fn get_turns(&self, task_id: &str) -> Vec<ConversationTurn> {
        group_turns(&self.get_unified_conversation(task_id))
    }

    /// Apply a fragment; a completion schedules one refetch of its task.
    pub fn apply_fragment(&self, fragment: StreamingFragment) -> FragmentOutcome {
        let message_id = fragment.message_id.clone();
        let outcome = self
            .write()
            .accumulator
            .apply(fragment, Instant::now().into_std());

        match &outcome {
            FragmentOutcome::Completed { task_id } => {
                debug!(%task_id, %message_id, "stream completed; refetching conversation");
                self.spawn_refetch(task_id.clone());
            }
            FragmentOutcome::DuplicateCompletion => {
                debug!(%message_id, "ignoring duplicate completion");
            }
            FragmentOutcome::Stale => debug!(%message_id, "discarding stale fragment"),
            FragmentOutcome::Late => debug!(%message_id, "discarding fragment after completion"),
            FragmentOutcome::Started | FragmentOutcome::Updated => {}
        }
        if outcome.changed() {
            self.bump();
        }
        outcome
    }

    /// Handle a dispatched event. Non-streaming events are ignored.
    pub fn handle_envelope(&self, envelope: &Envelope) -> Option<FragmentOutcome> {
        if !envelope.is_streaming_fragment() {
            return None;
        }
        match envelope.decode_fragment() {
            Ok(fragment) => Some(self.apply_fragment(fragment)),
            Err(error) => {
                warn!("dropping malformed streaming fragment: {}", error);
                None
            }
        }
    }

    /// Subscribe to streaming fragments and consume them on a spawned task.
    pub fn attach(&self, registry: &SubscriptionRegistry) -> (String, JoinHandle<()>) {
        let (id, receiver) = registry
            .subscribe_channel(SubscriptionFilter::event_types([MESSAGE_STREAMING_EVENT_TYPE]));
        let store = self.clone();
        let handle = tokio::spawn(store.consume(receiver));
        (id, handle)
    }

    /// Invalidate and refetch `task_id`, keeping current records until the
    /// fresh ones arrive.
    pub async fn refetch(&self, task_id: &str) {
        self.inner.source.invalidate(task_id);
        let ticket = self.issue_fetch(task_id);
        match self.inner.source.fetch_persisted_conversation(task_id).await {
            Ok(messages) => {
                let _ = self.store_persisted(task_id, ticket, messages);
            }
            Err(error) => warn!(%task_id, "conversation refetch failed: {}", error),
        }
    }

    /// Abort in-flight refetches and drop all state.
    pub fn shutdown(&self) {
        self.refetches().abort_all();
        let mut state = self.write();
        state.accumulator.clear();
        state.persisted.clear();
        state.generations.clear();
    }

    async fn consume(self, mut receiver: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = receiver.recv().await {
            let _ = self.handle_envelope(&envelope);
        }
    }

    fn spawn_refetch(&self, task_id: String) {
        let store = self.clone();
        let mut refetches = self.refetches();
        while refetches.try_join_next().is_some() {}
        refetches.spawn(async move { store.refetch(&task_id).await });
    }

    fn issue_fetch(&self, task_id: &str) -> FetchTicket {
        let mut state = self.write();
        let mark = state.accumulator.completion_mark();
        let generation = state.generations.entry(task_id.to_string()).or_default();
        generation.issued += 1;
        FetchTicket {
            generation: generation.issued,
            mark,
        }
    }

    /// Store a fetch response unless a newer one for the task already landed.
    fn store_persisted(
        &self,
        task_id: &str,
        ticket: FetchTicket,
        messages: Vec<PersistedMessage>,
    ) -> bool {
        let persisted_ids: HashSet<String> = messages
            .iter()
            .filter_map(|message| message.id.as_deref().map(str::trim))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        {
            let mut state = self.write();
            let generation = state.generations.entry(task_id.to_string()).or_default();
            if ticket.generation <= generation.applied {
                debug!(
                    %task_id,
                    generation = ticket.generation,
                    applied = generation.applied,
                    "discarding superseded conversation response"
                );
                return false;
            }
            generation.applied = ticket.generation;

            let settled = state.accumulator.settle(task_id, &persisted_ids, ticket.mark);
            if settled.released > 0 {
                debug!(
                    %task_id,
                    released = settled.released,
                    "persisted records replaced completed streams"
                );
            }
            if settled.abandoned > 0 {
                warn!(
                    %task_id,
                    abandoned = settled.abandoned,
                    "dropping completed streams the persisted record never included"
                );
            }
            state.persisted.insert(task_id.to_string(), messages);
        }
        self.bump();
        true
    }

    fn bump(&self) {
        self.inner
            .revision
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn refetches(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.inner
            .refetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
