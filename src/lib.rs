pub mod api;
pub mod approval;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod node;
pub mod pod;
pub mod redact;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tracker;
pub mod worker;
