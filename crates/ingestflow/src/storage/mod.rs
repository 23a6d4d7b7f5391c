//! Durable persistence for upload queues

mod database;

pub use database::{QueueStore, SqliteQueueStore};
