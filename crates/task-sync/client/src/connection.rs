//! Connection lifecycle for the task event socket.
//!
//! One driver task owns the socket at a time. It sends heartbeat pings while
//! the socket is open, forwards decoded events to the dispatcher, and on close
//! waits a fixed interval before reconnecting, up to a hard attempt ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use task_sync::{Envelope, InboundFrame, OutboundFrame, decode_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{ClientError, Result};
use crate::transport::{Connector, Socket, SocketEvent};

/// Read-only connection snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Offline,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        }
    }

    /// Classify a snapshot. `running` is whether a driver is still alive.
    #[must_use]
    pub fn from_state(state: &ConnectionState, running: bool) -> Self {
        match (running, state.connected) {
            (_, true) => Self::Live,
            (true, false) if state.reconnect_attempts > 0 => Self::Reconnecting,
            (true, false) => Self::Connecting,
            (false, false) if state.error.is_some() => Self::Offline,
            (false, false) => Self::Idle,
        }
    }
}

/// Reconnect policy and socket timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl From<&SyncConfig> for ConnectionConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
        }
    }
}

pub struct ConnectionManager {
    link: DriverLink,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct DriverLink {
    url: Url,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<Envelope>,
    manual_disconnect: Arc<AtomicBool>,
}

enum SessionEnd {
    Closed,
    Failed(String),
}

impl ConnectionManager {
    /// Decoded events are forwarded on `events`.
    pub fn new(
        url: Url,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> Result<Self> {
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        let (state, _) = watch::channel(ConnectionState::default());

        Ok(Self {
            link: DriverLink {
                url,
                config: ConnectionConfig {
                    heartbeat_interval: config.heartbeat_interval.max(Duration::from_millis(1)),
                    ..config
                },
                connector,
                state: Arc::new(state),
                events,
                manual_disconnect: Arc::new(AtomicBool::new(false)),
            },
            driver: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        self.link.url.as_str()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    /// Start the driver unless one is already running.
    pub fn connect(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("connect ignored: driver already running for {}", self.link.url);
            return;
        }
        self.link.manual_disconnect.store(false, Ordering::SeqCst);
        let link = self.link.clone();
        *driver = Some(tokio::spawn(link.run()));
    }

    /// Stop the driver, cancelling any heartbeat or pending reconnect.
    pub async fn disconnect(&self) {
        self.link.manual_disconnect.store(true, Ordering::SeqCst);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("disconnected from {}", self.link.url);
        }
        self.link.publish(|state| {
            state.connected = false;
            state.connecting = false;
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_state(&self.state(), self.is_running())
    }

    pub fn is_running(&self) -> bool {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.link.manual_disconnect.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl DriverLink {
    fn publish(&self, update: impl FnOnce(&mut ConnectionState)) {
        self.state.send_modify(update);
    }

    fn is_manual(&self) -> bool {
        self.manual_disconnect.load(Ordering::SeqCst)
    }

    async fn run(self) {
        loop {
            self.publish(|state| state.connecting = true);
            debug!("connecting to {}", self.url);

            let end = match timeout(self.config.connect_timeout, self.connector.connect(&self.url))
                .await
            {
                Ok(Ok(socket)) => self.serve(socket).await,
                Ok(Err(error)) => SessionEnd::Failed(error.to_string()),
                Err(_) => SessionEnd::Failed(
                    ClientError::Timeout(format!(
                        "connection timeout after {:?}",
                        self.config.connect_timeout
                    ))
                    .to_string(),
                ),
            };

            self.publish(|state| {
                state.connected = false;
                state.connecting = false;
                if let SessionEnd::Failed(error) = &end {
                    state.error = Some(error.clone());
                }
            });
            if let SessionEnd::Failed(error) = &end {
                warn!("connection to {} failed: {}", self.url, error);
            }
            if self.is_manual() {
                return;
            }

            let attempts = self.state.borrow().reconnect_attempts;
            if attempts >= self.config.max_reconnect_attempts {
                let exhausted = ClientError::RetriesExhausted { attempts };
                warn!("{} for {}; staying offline", exhausted, self.url);
                self.publish(|state| state.error = Some(exhausted.to_string()));
                return;
            }

            let attempt = attempts.saturating_add(1);
            self.publish(|state| state.reconnect_attempts = attempt);
            info!(
                attempt,
                delay_ms = self.config.reconnect_interval.as_millis() as u64,
                "scheduling reconnect to {}",
                self.url
            );
            sleep(self.config.reconnect_interval).await;
            if self.is_manual() {
                return;
            }
        }
    }

    async fn serve(&self, socket: Socket) -> SessionEnd {
        let Socket {
            outbound,
            mut inbound,
        } = socket;
        self.publish(|state| {
            state.connected = true;
            state.connecting = false;
            state.error = None;
            state.reconnect_attempts = 0;
        });
        info!("connected to {}", self.url);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(SocketEvent::Text(text)) => self.handle_text(&text),
                    Some(SocketEvent::Error(error)) => {
                        warn!("socket error on {}: {}", self.url, error);
                        self.publish(|state| state.error = Some(error));
                    }
                    Some(SocketEvent::Closed(reason)) => {
                        info!("socket closed by {} ({})", self.url, reason.as_deref().unwrap_or("no reason"));
                        return SessionEnd::Closed;
                    }
                    None => return SessionEnd::Closed,
                },
                _ = heartbeat.tick() => match OutboundFrame::Ping.encode() {
                    Ok(ping) => {
                        if outbound.send(ping).is_err() {
                            return SessionEnd::Closed;
                        }
                        debug!("sent heartbeat ping to {}", self.url);
                    }
                    Err(error) => warn!("failed to encode heartbeat: {}", error),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Ok(InboundFrame::Pong) => debug!("heartbeat acknowledged by {}", self.url),
            Ok(InboundFrame::Event(envelope)) => {
                self.publish(|state| state.last_event_time = Some(Utc::now()));
                if self.events.send(envelope).is_err() {
                    debug!("dispatcher stopped; dropping event from {}", self.url);
                }
            }
            Err(error) => warn!("dropping malformed frame from {}: {}", self.url, error),
        }
    }
}
