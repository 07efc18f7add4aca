use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use task_sync::{Envelope, PersistedMessage, Role};
use task_sync_client::{
    ClientError, ConnectionState, ConnectionStatus, Connector, ConversationSource, Result, Socket,
    SocketEvent, SubscriptionFilter, SyncConfig, TaskSync,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use url::Url;

#[derive(Debug, Clone, Copy)]
enum Step {
    Refuse,
    Accept,
}

/// Far end of an accepted socket, held by the test.
struct ServerSide {
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerSide {
    fn send(&self, text: &str) {
        let _ = self.to_client.send(SocketEvent::Text(text.to_string()));
    }

    fn sent_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

struct ScriptedConnector {
    attempts: AtomicUsize,
    plan: Mutex<VecDeque<Step>>,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedConnector {
    fn new(plan: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                plan: Mutex::new(plan.iter().copied().collect()),
                accepted,
            }),
            servers,
        )
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> Result<Socket> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .plan
            .lock()
            .map_err(|error| ClientError::Internal(error.to_string()))?
            .pop_front()
            .unwrap_or(Step::Refuse);

        match step {
            Step::Refuse => Err(ClientError::WebSocket("connection refused".to_string())),
            Step::Accept => {
                let (socket, from_client, to_client) = Socket::pair();
                self.accepted
                    .send(ServerSide {
                        to_client,
                        from_client,
                    })
                    .map_err(|error| ClientError::Internal(error.to_string()))?;
                Ok(socket)
            }
        }
    }
}

#[derive(Default)]
struct MemorySource {
    conversations: Mutex<HashMap<String, Vec<PersistedMessage>>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    fn set(&self, task_id: &str, messages: Vec<PersistedMessage>) {
        if let Ok(mut conversations) = self.conversations.lock() {
            conversations.insert(task_id.to_string(), messages);
        }
    }
}

#[async_trait]
impl ConversationSource for MemorySource {
    async fn fetch_persisted_conversation(&self, task_id: &str) -> Result<Vec<PersistedMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .conversations
            .lock()
            .map_err(|error| ClientError::Internal(error.to_string()))?
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn test_config() -> SyncConfig {
    SyncConfig::new("http://tasks.test")
}

type Harness = (
    TaskSync,
    Arc<ScriptedConnector>,
    mpsc::UnboundedReceiver<ServerSide>,
    Arc<MemorySource>,
);

fn start(plan: &[Step]) -> Result<Harness> {
    let (connector, servers) = ScriptedConnector::new(plan);
    let source = Arc::new(MemorySource::default());
    let sync = TaskSync::init(&test_config(), connector.clone(), source.clone())?;
    Ok((sync, connector, servers, source))
}

async fn wait_for<F>(
    state: &mut watch::Receiver<ConnectionState>,
    predicate: F,
) -> Result<ConnectionState>
where
    F: FnMut(&ConnectionState) -> bool,
{
    let snapshot = timeout(Duration::from_secs(120), state.wait_for(predicate))
        .await
        .map_err(|_| ClientError::Timeout("state never matched".to_string()))?
        .map_err(|error| ClientError::Internal(error.to_string()))?;
    Ok(snapshot.clone())
}

async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> Result<ServerSide> {
    timeout(Duration::from_secs(120), servers.recv())
        .await
        .map_err(|_| ClientError::Timeout("no socket accepted".to_string()))?
        .ok_or_else(|| ClientError::Internal("connector dropped".to_string()))
}

#[tokio::test(start_paused = true)]
async fn reconnects_stop_at_attempt_ceiling() -> Result<()> {
    let (sync, connector, _servers, _source) = start(&[])?;

    sync.connect();
    sleep(Duration::from_secs(60)).await;

    let state = sync.connection_state();
    assert_eq!(connector.attempts(), 11, "initial attempt plus ten reconnects");
    assert_eq!(state.reconnect_attempts, 10);
    assert!(!state.connected && !state.connecting);
    assert!(
        state
            .error
            .as_deref()
            .is_some_and(|error| error.contains("exhausted")),
        "unexpected error: {:?}",
        state.error
    );
    assert_eq!(sync.connection_status(), ConnectionStatus::Offline);

    sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.attempts(), 11);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_waits_fixed_interval() -> Result<()> {
    let (sync, connector, mut servers, _source) = start(&[Step::Accept, Step::Accept])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    let first = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    drop(first);
    let closed = wait_for(&mut state, |state| !state.connected).await?;
    assert_eq!(closed.reconnect_attempts, 1);

    sleep(Duration::from_millis(2_900)).await;
    assert_eq!(connector.attempts(), 1);

    let _second = next_server(&mut servers).await?;
    let reopened = wait_for(&mut state, |state| state.connected).await?;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(reopened.reconnect_attempts, 0, "open resets the counter");
    assert_eq!(reopened.error, None);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_attempts_after_failures() -> Result<()> {
    let (sync, connector, mut servers, _source) =
        start(&[Step::Refuse, Step::Refuse, Step::Accept])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    let failing = wait_for(&mut state, |state| state.reconnect_attempts == 2).await?;
    assert!(failing.error.is_some());

    let _server = next_server(&mut servers).await?;
    let live = wait_for(&mut state, |state| state.connected).await?;

    assert_eq!(connector.attempts(), 3);
    assert_eq!(live.reconnect_attempts, 0);
    assert_eq!(live.error, None);
    assert_eq!(sync.connection_status(), ConnectionStatus::Live);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_wait_cancels_retry() -> Result<()> {
    let (sync, connector, _servers, _source) = start(&[])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    wait_for(&mut state, |state| state.reconnect_attempts == 1).await?;
    sleep(Duration::from_secs(1)).await;
    sync.disconnect().await;

    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    let state = sync.connection_state();
    assert!(!state.connected && !state.connecting);
    assert_eq!(sync.connection_status(), ConnectionStatus::Offline);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_does_not_reconnect() -> Result<()> {
    let (sync, connector, mut servers, _source) = start(&[Step::Accept, Step::Accept])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    let _server = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    sync.disconnect().await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(connector.attempts(), 1);
    let state = sync.connection_state();
    assert!(!state.connected);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(state.error, None);
    assert_eq!(sync.connection_status(), ConnectionStatus::Idle);

    sync.connect();
    let _again = next_server(&mut servers).await?;
    assert_eq!(connector.attempts(), 2);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() -> Result<()> {
    let (sync, connector, mut servers, _source) = start(&[Step::Accept, Step::Accept])?;

    sync.connect();
    sync.connect();
    let _server = next_server(&mut servers).await?;
    sync.connect();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(connector.attempts(), 1);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_on_interval_while_open() -> Result<()> {
    let (sync, _connector, mut servers, _source) = start(&[Step::Accept])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    let mut server = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    sleep(Duration::from_secs(29)).await;
    assert!(server.sent_frames().is_empty());

    sleep(Duration::from_secs(62)).await;
    let frames = server.sent_frames();
    assert_eq!(frames, vec![r#"{"type":"ping"}"#.to_string(); 3]);

    sync.disconnect().await;
    sleep(Duration::from_secs(90)).await;
    assert!(server.sent_frames().is_empty());
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn frames_dispatch_in_order_and_skip_pongs_and_garbage() -> Result<()> {
    let (sync, _connector, mut servers, _source) = start(&[Step::Accept])?;
    let (_id, mut events) = sync.subscribe_channel(SubscriptionFilter::all());
    let mut state = sync.watch_connection_state();

    sync.connect();
    let server = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    server.send(r#"{"type":"pong"}"#);
    assert_eq!(sync.connection_state().last_event_time, None);

    server.send(r#"{"event":{"event_type":"task_created","timestamp":"2026-03-01T10:00:00Z","task_id":"t1"}}"#);
    server.send("{not json");
    server.send(r#"{"timestamp":"2026-03-01T10:00:01Z"}"#);
    server.send(r#"{"event_type":"task_updated","timestamp":"2026-03-01T10:00:02Z","task_id":"t1","status":"done"}"#);

    let first = timeout(Duration::from_secs(5), events.recv()).await.ok().flatten();
    let second = timeout(Duration::from_secs(5), events.recv()).await.ok().flatten();
    let types: Vec<String> = [first, second]
        .into_iter()
        .flatten()
        .map(|envelope: Envelope| envelope.event_type)
        .collect();
    assert_eq!(types, vec!["task_created", "task_updated"]);
    assert!(events.try_recv().is_err());

    let state = sync.connection_state();
    assert!(state.connected, "malformed frames must not close the socket");
    assert!(state.last_event_time.is_some());
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn socket_error_is_recorded_without_closing() -> Result<()> {
    let (sync, connector, mut servers, _source) = start(&[Step::Accept])?;
    let mut state = sync.watch_connection_state();

    sync.connect();
    let server = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    let _ = server
        .to_client
        .send(SocketEvent::Error("frame too large".to_string()));
    let errored = wait_for(&mut state, |state| state.error.is_some()).await?;

    assert!(errored.connected);
    assert_eq!(errored.error.as_deref(), Some("frame too large"));
    assert_eq!(connector.attempts(), 1);
    sync.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn completed_stream_refetches_once_and_replaces_live_entry() -> Result<()> {
    let (sync, _connector, mut servers, source) = start(&[Step::Accept])?;
    source.set(
        "t1",
        vec![PersistedMessage {
            id: Some("u1".to_string()),
            role: Role::User,
            content: Some("summarize the logs".to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            message_index: Some(0),
            created_at: None,
        }],
    );
    sync.load_conversation("t1").await?;
    let mut changes = sync.conversation_changes();
    let mut state = sync.watch_connection_state();

    sync.connect();
    let server = next_server(&mut servers).await?;
    wait_for(&mut state, |state| state.connected).await?;

    let fragment = |content: &str, index: u64, done: bool| {
        json!({
            "event_type": "message_streaming",
            "timestamp": "2026-03-01T10:00:00Z",
            "task_id": "t1",
            "message_id": "a1",
            "role": "assistant",
            "content": content,
            "message_index": 1,
            "stream_index": index,
            "is_complete": done
        })
        .to_string()
    };

    server.send(&fragment("All", 0, false));
    server.send(&fragment("All good", 1, false));
    let _ = changes.borrow_and_update();
    timeout(Duration::from_secs(5), async {
        while !sync.store().is_streaming("a1") {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .map_err(|_| ClientError::Timeout("stream never started".to_string()))?;

    let live = sync.get_unified_conversation("t1");
    assert_eq!(live.len(), 2);
    assert!(live[1].is_streaming);

    source.set(
        "t1",
        vec![
            PersistedMessage {
                id: Some("u1".to_string()),
                role: Role::User,
                content: Some("summarize the logs".to_string()),
                reasoning: None,
                tool_calls: None,
                tool_call_id: None,
                name: None,
                message_index: Some(0),
                created_at: None,
            },
            PersistedMessage {
                id: Some("a1".to_string()),
                role: Role::Assistant,
                content: Some("All good.".to_string()),
                reasoning: None,
                tool_calls: None,
                tool_call_id: None,
                name: None,
                message_index: Some(1),
                created_at: None,
            },
        ],
    );
    server.send(&fragment("All good.", 2, true));
    server.send(&fragment("All good.", 2, true));
    sleep(Duration::from_millis(100)).await;

    assert_eq!(source.fetches.load(Ordering::SeqCst), 2, "initial load plus one refetch");
    let settled = sync.get_unified_conversation("t1");
    assert_eq!(settled.len(), 2);
    assert!(!settled[1].is_streaming);
    assert_eq!(settled[1].content.as_deref(), Some("All good."));
    assert_eq!(sync.get_turns("t1").len(), 2);
    sync.shutdown().await;
    Ok(())
}
