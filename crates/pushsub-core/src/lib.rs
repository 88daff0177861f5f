//! `pushsub` Core Library
//!
//! Lifecycle management for push-notification subscribers:
//! - Explicit subscriber state machine (idle, pending, retrying, terminated)
//! - Backoff policy with suspend/terminate escalation
//! - Store, dispatcher, clock and jitter capability traits
//! - Configuration resolution, tracing setup and shared `SQLite` helpers

pub mod backoff;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod store;
pub mod subscriber;
pub mod tracing_init;

pub use backoff::{BackoffPolicy, Decision};
pub use clock::{Clock, JitterSource, SystemClock, ThreadRngJitter};
pub use config::Config;
pub use dispatch::{DispatchError, Dispatcher, JobKind, Priority};
pub use error::{Error, Result};
pub use lifecycle::{PublishSummary, SubscriptionLifecycle, Transition};
pub use store::{MemoryStore, Replaced, StoreError, SubscriptionStore};
pub use subscriber::{Renewal, RetryState, StateCounts, StateUpdate, Subscriber};
