//! Task conversation model.
//!
//! Everything here is pure: no sockets, timers, or HTTP. The client crate
//! feeds it frames and clock readings.
//! - wire envelope and frame codec
//! - streaming fragment accumulation
//! - persisted/live reconciliation
//! - turn grouping for display

pub mod accumulator;
pub mod envelope;
pub mod error;
pub mod merge;
pub mod message;
pub mod turns;

pub use accumulator::{
    DEFAULT_COMPLETION_EXPIRY, FragmentOutcome, MAX_SETTLE_MISSES, Settled, StreamingAccumulator,
    StreamingEntry,
};
pub use envelope::{
    Envelope, InboundFrame, MESSAGE_STREAMING_EVENT_TYPE, OutboundFrame, PONG_EVENT_TYPE,
    StreamingFragment, decode_frame,
};
pub use error::{FrameError, Result};
pub use merge::{merge_conversation, merge_with_pending};
pub use message::{PersistedMessage, Role, ToolCall, ToolFunction, UnifiedMessage};
pub use turns::{AssistantTurn, ConversationTurn, ToolInteraction, group_turns};
