//! Dispatcher backends for the hub.

mod outbox;

pub use outbox::OutboxDispatcher;
