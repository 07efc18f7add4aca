//! Task event socket client.
//!
//! This crate keeps a single reconnecting socket to the task service and
//! builds live conversation views on top of it:
//! - connection lifecycle with fixed-interval, capped reconnects and heartbeat
//! - filtered subscription fanout
//! - conversation store reconciling live streams with persisted records

pub mod config;
pub mod connection;
pub mod error;
pub mod source;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::{ClientError, Result};
pub use source::{ConversationSource, HttpConversationSource};
pub use store::ConversationStore;
pub use subscription::{EventHandler, Subscription, SubscriptionFilter, SubscriptionRegistry};
pub use sync::TaskSync;
pub use transport::{Connector, Socket, SocketEvent, WsConnector};
