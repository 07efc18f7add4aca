//! Live accumulation of streaming message fragments.
//!
//! Each message id moves through `absent -> streaming -> complete -> absent`.
//! Fragments carry cumulative values, so an update replaces the entry's
//! content instead of appending to it. Completion removes the entry from the
//! live map and reports the task so the caller can refetch the persisted
//! record. The last accumulated value is retained as a pending-final entry
//! until that refetch delivers the record, or until enough later refetches
//! come back without it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::envelope::StreamingFragment;
use crate::message::{Role, ToolCall, UnifiedMessage};

pub const DEFAULT_COMPLETION_EXPIRY: Duration = Duration::from_millis(1_000);

/// Persisted records that may come back without a completed message before
/// its pending-final entry is dropped.
pub const MAX_SETTLE_MISSES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingEntry {
    pub id: String,
    pub task_id: String,
    pub role: Role,
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub stream_index: u64,
    pub message_index: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub is_complete: bool,
}

impl StreamingEntry {
    fn from_fragment(fragment: StreamingFragment) -> Self {
        Self {
            id: fragment.message_id,
            task_id: fragment.task_id,
            role: fragment.role,
            content: fragment.content,
            reasoning: fragment.reasoning,
            tool_calls: fragment.tool_calls,
            tool_call_id: fragment.tool_call_id,
            name: fragment.name,
            stream_index: fragment.stream_index,
            message_index: fragment.message_index,
            created_at: fragment.created_at,
            is_complete: fragment.is_complete,
        }
    }

    fn absorb(&mut self, fragment: StreamingFragment) {
        self.role = fragment.role;
        self.content = fragment.content;
        self.reasoning = fragment.reasoning;
        self.tool_calls = fragment.tool_calls;
        if fragment.tool_call_id.is_some() {
            self.tool_call_id = fragment.tool_call_id;
        }
        if fragment.name.is_some() {
            self.name = fragment.name;
        }
        if fragment.message_index.is_some() {
            self.message_index = fragment.message_index;
        }
        if self.created_at.is_none() {
            self.created_at = fragment.created_at;
        }
        self.stream_index = fragment.stream_index;
        self.is_complete = fragment.is_complete;
    }

    #[must_use]
    pub fn to_unified(&self, is_streaming: bool) -> UnifiedMessage {
        UnifiedMessage {
            id: self.id.clone(),
            role: self.role.clone(),
            content: Some(self.content.clone()),
            reasoning: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            tool_calls: self.tool_calls.clone().unwrap_or_default(),
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
            message_index: self.message_index,
            created_at: self.created_at,
            is_streaming,
        }
    }
}

/// What applying one fragment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Started,
    Updated,
    /// Stream index regressed; the frame was discarded.
    Stale,
    /// A non-final fragment for an id that completed inside the expiry window.
    Late,
    /// The entry left the live map; the task's persisted record must be refetched.
    Completed { task_id: String },
    DuplicateCompletion,
}

impl FragmentOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Updated | Self::Completed { .. }
        )
    }

    #[must_use]
    pub fn refetch_task(&self) -> Option<&str> {
        match self {
            Self::Completed { task_id } => Some(task_id.as_str()),
            _ => None,
        }
    }
}

/// Outcome of [`StreamingAccumulator::settle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settled {
    /// Entries whose id is now persisted.
    pub released: usize,
    /// Entries dropped after [`MAX_SETTLE_MISSES`] records without their id.
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
struct PendingFinal {
    entry: StreamingEntry,
    completion: u64,
    misses: u32,
}

#[derive(Debug, Clone)]
pub struct StreamingAccumulator {
    completion_expiry: Duration,
    live: Arc<HashMap<String, StreamingEntry>>,
    completed: HashMap<String, Instant>,
    pending_final: HashMap<String, PendingFinal>,
    completions: u64,
}

impl Default for StreamingAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_EXPIRY)
    }
}

impl StreamingAccumulator {
    #[must_use]
    pub fn new(completion_expiry: Duration) -> Self {
        Self {
            completion_expiry,
            live: Arc::new(HashMap::new()),
            completed: HashMap::new(),
            pending_final: HashMap::new(),
            completions: 0,
        }
    }

    pub fn apply(&mut self, fragment: StreamingFragment, now: Instant) -> FragmentOutcome {
        self.expire(now);

        if self.completed.contains_key(&fragment.message_id) {
            return if fragment.is_complete {
                FragmentOutcome::DuplicateCompletion
            } else {
                FragmentOutcome::Late
            };
        }

        let id = fragment.message_id.clone();
        let existing_index = self.live.get(&id).map(|entry| entry.stream_index);
        let regressed = existing_index.is_some_and(|index| fragment.stream_index < index);

        if fragment.is_complete {
            let mut entry = match Arc::make_mut(&mut self.live).remove(&id) {
                Some(mut entry) if !regressed => {
                    entry.absorb(fragment);
                    entry
                }
                Some(mut entry) => {
                    entry.is_complete = true;
                    entry
                }
                None => StreamingEntry::from_fragment(fragment),
            };
            entry.is_complete = true;
            let task_id = entry.task_id.clone();
            self.completions += 1;
            self.completed.insert(id.clone(), now + self.completion_expiry);
            self.pending_final.insert(
                id,
                PendingFinal {
                    entry,
                    completion: self.completions,
                    misses: 0,
                },
            );
            return FragmentOutcome::Completed { task_id };
        }

        if regressed {
            return FragmentOutcome::Stale;
        }

        let live = Arc::make_mut(&mut self.live);
        match live.get_mut(&id) {
            Some(entry) => {
                entry.absorb(fragment);
                FragmentOutcome::Updated
            }
            None => {
                self.pending_final.remove(&id);
                live.insert(id, StreamingEntry::from_fragment(fragment));
                FragmentOutcome::Started
            }
        }
    }

    /// Drop completion flags whose window has passed.
    pub fn expire(&mut self, now: Instant) {
        self.completed.retain(|_, expires_at| *expires_at > now);
    }

    #[must_use]
    pub fn is_streaming(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    #[must_use]
    pub fn is_completed(&self, id: &str, now: Instant) -> bool {
        self.completed
            .get(id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    #[must_use]
    pub fn entry(&self, id: &str) -> Option<&StreamingEntry> {
        self.live.get(id)
    }

    /// Shared view of the live map as of now. Later writes never touch it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, StreamingEntry>> {
        Arc::clone(&self.live)
    }

    #[must_use]
    pub fn live_for_task(&self, task_id: &str) -> Vec<StreamingEntry> {
        self.live
            .values()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn pending_final_for_task(&self, task_id: &str) -> Vec<StreamingEntry> {
        self.pending_final
            .values()
            .filter(|pending| pending.entry.task_id == task_id)
            .map(|pending| pending.entry.clone())
            .collect()
    }

    /// Number of completions seen so far. Take it when a refetch is issued
    /// and hand it back to [`settle`](Self::settle) with the response.
    #[must_use]
    pub fn completion_mark(&self) -> u64 {
        self.completions
    }

    /// Reconcile pending-final entries of `task_id` with a persisted record
    /// requested at `mark`.
    ///
    /// Entries whose id is persisted are released. Entries that completed
    /// before the request but are still missing count a miss and are dropped
    /// on the [`MAX_SETTLE_MISSES`]th.
    pub fn settle(
        &mut self,
        task_id: &str,
        persisted_ids: &HashSet<String>,
        mark: u64,
    ) -> Settled {
        let mut settled = Settled::default();
        self.pending_final.retain(|id, pending| {
            if pending.entry.task_id != task_id {
                return true;
            }
            if persisted_ids.contains(id) {
                settled.released += 1;
                return false;
            }
            if pending.completion > mark {
                return true;
            }
            pending.misses += 1;
            if pending.misses >= MAX_SETTLE_MISSES {
                settled.abandoned += 1;
                return false;
            }
            true
        });
        settled
    }

    pub fn clear(&mut self) {
        self.live = Arc::new(HashMap::new());
        self.completed.clear();
        self.pending_final.clear();
    }
}
