//! Worker-pool backend.
//!
//! The dispatcher publishes a [`TaskMessage`] to the queue's broker topic;
//! [`WorkerPool`] slots consume it, load the job from the registry and run
//! it through the shared runtime, writing status and logs via the tracker.
//!
//! # Components
//!
//! - [`Broker`]: topic queue ([`MemoryBroker`] in-process, [`RedisBroker`] shared)
//! - [`WorkerPool`]: N slots, one job at a time each

pub mod broker;
pub mod pool;

pub use broker::{Broker, MemoryBroker, RedisBroker, TaskMessage};
pub use pool::WorkerPool;
