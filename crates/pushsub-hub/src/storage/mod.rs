//! `SQLite` storage for the pushsub hub.
//!
//! Holds subscriber rows and the delivery outbox. [`HubDatabase`] implements
//! [`pushsub_core::SubscriptionStore`].

mod models;
mod queries;
mod queries_jobs;

#[cfg(test)]
mod tests;

pub use models::*;
pub use pushsub_core::db::DatabaseError;

pushsub_core::define_database!(HubDatabase, "Hub database migrations complete");
