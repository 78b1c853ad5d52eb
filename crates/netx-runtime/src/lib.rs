//! netx runtime - Command Orchestration Primitives
//!
//! Concurrency building blocks shared by the tunnel client. Nothing in
//! this crate knows about VPNs.
//!
//! # Architecture
//!
//! ```text
//!   callers ──send()──▶ ┌───────────┐   ComponentEvent   ┌───────────────────┐
//!                       │ TaskQueue │ ─────────────────▶ │ ProcessingTracker │
//!   callers ◀─result─── └───────────┘    (ActivityBus)   └─────────┬─────────┘
//!                                                                  │ EventBus
//!                                                                  ▼
//!                                                    ongoing / connIssues / errors
//! ```
//!
//! # Features
//!
//! - **TaskQueue**: named single-flight executor with debounce, timeout and retry
//! - **EventBus**: typed pub/sub with optional replay and duplicate suppression
//! - **ProcessingTracker**: rolling "ongoing work" and connectivity-issue signals
//! - **TaskGroup**: background tasks owned and shut down by their component

mod bus;
mod event;
mod queue;
mod supervisor;
mod tracker;

pub use bus::{BusOptions, EventBus, Subscription};
pub use event::{ActivityBus, ComponentEvent, ErrorClass, EventKind, Severity};
pub use queue::{
    DEFAULT_TASK_TIMEOUT, DEFAULT_USER_INTERACTION_DEBOUNCE, QueueConfig, QueueError,
    TaskFailure, TaskFuture, TaskQueue,
};
pub use supervisor::TaskGroup;
pub use tracker::{ProcessingTracker, TrackedError, TrackerConfig};
