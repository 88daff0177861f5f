//! pushsub Hub
//!
//! `SQLite`-backed adapters for the subscriber lifecycle:
//! - [`storage::HubDatabase`]: subscriber rows, implements `SubscriptionStore`
//! - [`dispatch::OutboxDispatcher`]: durable, priority-ordered delivery jobs
//! - [`scheduler`]: periodic requeue and pruning

pub mod dispatch;
pub mod scheduler;
pub mod storage;
