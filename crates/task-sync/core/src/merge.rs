//! Reconciliation of persisted records with live streaming entries.

use std::collections::HashMap;

use crate::accumulator::StreamingEntry;
use crate::message::{PersistedMessage, UnifiedMessage};

/// Merge a task's persisted records with its live entries.
///
/// A live entry replaces the persisted record sharing its id, in place;
/// otherwise it is appended. Records without an id are skipped and repeated
/// persisted ids keep their first occurrence. The result is ordered by
/// `message_index` where present, then by `created_at`.
#[must_use]
pub fn merge_conversation(
    persisted: &[PersistedMessage],
    live: &[StreamingEntry],
) -> Vec<UnifiedMessage> {
    merge_with_pending(persisted, live, &[])
}

/// Like [`merge_conversation`], additionally keeping just-completed entries
/// visible until their persisted record arrives.
#[must_use]
pub fn merge_with_pending(
    persisted: &[PersistedMessage],
    live: &[StreamingEntry],
    pending_final: &[StreamingEntry],
) -> Vec<UnifiedMessage> {
    let mut merged: Vec<UnifiedMessage> = Vec::with_capacity(persisted.len() + live.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for message in persisted {
        let Some(unified) = UnifiedMessage::from_persisted(message) else {
            continue;
        };
        if positions.contains_key(&unified.id) {
            continue;
        }
        positions.insert(unified.id.clone(), merged.len());
        merged.push(unified);
    }

    for entry in live {
        let unified = entry.to_unified(true);
        match positions.get(&entry.id) {
            Some(&position) => merged[position] = unified,
            None => {
                positions.insert(entry.id.clone(), merged.len());
                merged.push(unified);
            }
        }
    }

    for entry in pending_final {
        if positions.contains_key(&entry.id) {
            continue;
        }
        positions.insert(entry.id.clone(), merged.len());
        merged.push(entry.to_unified(false));
    }

    order_messages(&mut merged);
    merged
}

fn order_messages(messages: &mut [UnifiedMessage]) {
    messages.sort_by_key(|message| {
        (
            message.message_index.is_none(),
            message.message_index,
            message.created_at.is_none(),
            message.created_at,
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::StreamingAccumulator;
    use crate::envelope::Envelope;
    use crate::error::Result;
    use crate::message::Role;
    use chrono::{DateTime, TimeZone, Utc};
    use quickcheck::{QuickCheck, TestResult};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Instant;

    fn at(seconds: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(1_767_225_600 + seconds, 0).single()
    }

    fn persisted(id: &str, index: Option<i64>, seconds: i64, content: &str) -> PersistedMessage {
        PersistedMessage {
            id: Some(id.to_string()),
            role: Role::Assistant,
            content: Some(content.to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            message_index: index,
            created_at: at(seconds),
        }
    }

    fn live(id: &str, index: Option<i64>, content: &str) -> StreamingEntry {
        StreamingEntry {
            id: id.to_string(),
            task_id: "task-1".to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            reasoning: String::new(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            stream_index: 0,
            message_index: index,
            created_at: None,
            is_complete: false,
        }
    }

    fn ids(messages: &[UnifiedMessage]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn live_entry_replaces_persisted_in_place() {
        let merged = merge_conversation(
            &[
                persisted("a", Some(0), 0, "first"),
                persisted("b", Some(1), 1, "stale"),
            ],
            &[live("b", Some(1), "fresh")],
        );

        assert_eq!(ids(&merged), vec!["a", "b"]);
        assert_eq!(merged[1].content.as_deref(), Some("fresh"));
        assert!(merged[1].is_streaming);
        assert!(!merged[0].is_streaming);
    }

    #[test]
    fn unpersisted_live_entries_append_after_indexed_messages() {
        let merged = merge_conversation(
            &[persisted("a", Some(0), 0, "q"), persisted("b", Some(1), 5, "r")],
            &[live("c", None, "typing")],
        );
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
    }

    #[test]
    fn ordering_prefers_message_index_then_created_at() {
        let merged = merge_conversation(
            &[
                persisted("late-index", Some(3), 0, ""),
                persisted("early-index", Some(1), 99, ""),
                persisted("newer", None, 20, ""),
                persisted("older", None, 10, ""),
            ],
            &[],
        );
        assert_eq!(ids(&merged), vec!["early-index", "late-index", "older", "newer"]);
    }

    #[test]
    fn records_without_ids_and_repeated_ids_are_dropped() {
        let mut anonymous = persisted("x", Some(0), 0, "anon");
        anonymous.id = None;
        let merged = merge_conversation(
            &[
                anonymous,
                persisted("a", Some(1), 0, "kept"),
                persisted("a", Some(2), 0, "repeat"),
            ],
            &[],
        );

        assert_eq!(ids(&merged), vec!["a"]);
        assert_eq!(merged[0].content.as_deref(), Some("kept"));
    }

    #[test]
    fn pending_final_fills_gap_until_persisted() {
        let mut done = live("b", Some(1), "complete answer");
        done.is_complete = true;

        let before_refetch = merge_with_pending(
            &[persisted("a", Some(0), 0, "question")],
            &[],
            std::slice::from_ref(&done),
        );
        assert_eq!(ids(&before_refetch), vec!["a", "b"]);
        assert!(!before_refetch[1].is_streaming);

        let after_refetch = merge_with_pending(
            &[
                persisted("a", Some(0), 0, "question"),
                persisted("b", Some(1), 1, "complete answer"),
            ],
            &[],
            &[done],
        );
        assert_eq!(ids(&after_refetch), vec!["a", "b"]);
    }

    #[test]
    fn numeric_ids_from_both_sources_reconcile() -> Result<()> {
        let record: PersistedMessage = serde_json::from_value(json!({
            "id": 42,
            "role": "assistant",
            "content": "partial",
            "message_index": 1
        }))?;
        let envelope = Envelope::new("message_streaming")
            .with_task_id("task-1")
            .with_field("message_id", json!(42))
            .with_field("content", json!("partial and more"))
            .with_field("stream_index", json!(3));
        let mut accumulator = StreamingAccumulator::default();
        let _ = accumulator.apply(envelope.decode_fragment()?, Instant::now());

        let merged = merge_conversation(&[record], &accumulator.live_for_task("task-1"));
        assert_eq!(ids(&merged), vec!["42"]);
        assert_eq!(merged[0].content.as_deref(), Some("partial and more"));
        assert!(merged[0].is_streaming);
        Ok(())
    }

    #[test]
    fn merged_length_accounts_for_overlap() {
        fn property(persisted_ids: Vec<u8>, live_ids: Vec<u8>) -> TestResult {
            let persisted_ids: Vec<u8> = unique(persisted_ids);
            let live_ids: Vec<u8> = unique(live_ids);
            let persisted_set: HashSet<u8> = persisted_ids.iter().copied().collect();
            let overlap = live_ids
                .iter()
                .filter(|id| persisted_set.contains(id))
                .count();

            let persisted_messages: Vec<PersistedMessage> = persisted_ids
                .iter()
                .enumerate()
                .map(|(index, id)| persisted(&id.to_string(), Some(index as i64), 0, "p"))
                .collect();
            let live_entries: Vec<StreamingEntry> = live_ids
                .iter()
                .map(|id| live(&id.to_string(), None, "l"))
                .collect();

            let merged = merge_conversation(&persisted_messages, &live_entries);
            let distinct: HashSet<&str> = merged.iter().map(|message| message.id.as_str()).collect();

            TestResult::from_bool(
                merged.len() == persisted_ids.len() + live_ids.len() - overlap
                    && distinct.len() == merged.len(),
            )
        }

        fn unique(ids: Vec<u8>) -> Vec<u8> {
            let mut seen = HashSet::new();
            ids.into_iter().filter(|id| seen.insert(*id)).collect()
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(Vec<u8>, Vec<u8>) -> TestResult);
    }
}
