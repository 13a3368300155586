//! Core contract shared by the sync runtime and UI consumers.
//!
//! This crate holds the canonical message model, the event normalizer, the
//! timeline merge buffer, the sync lifecycle model, and the error/notification
//! types. It performs no I/O.

/// Push notification bus.
pub mod channel;
/// Wall-clock abstraction used for expiry decisions.
pub mod clock;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// Wire event → canonical message normalization.
pub mod normalization;
/// Backoff policy used by retry loops and refresh governance.
pub mod retry;
/// Sync loop lifecycle state machine.
pub mod state_machine;
/// Sorted, deduplicated conversation timelines.
pub mod timeline;
/// Canonical data model and UI-facing events.
pub mod types;

pub use channel::{EventStream, SyncEventBus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use normalization::{EventNormalizer, HiddenReason, Normalized, NormalizedBatch};
pub use retry::RetryPolicy;
pub use state_machine::{SyncStateMachine, SyncTrigger};
pub use timeline::{ConversationTimeline, MergeOutcome};
pub use types::{
    CredentialBundle, LoadOptions, MediaRecord, MediaRef, Message, MessageKind, MessageType,
    OutgoingContent, Reaction, RoomMembership, RoomSummary, SubscribeOptions, SyncEvent,
    SyncLifecycleState, SyncStatus,
};
