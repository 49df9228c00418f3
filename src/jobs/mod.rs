//! Job definitions and the registry that discovers them.
//!
//! - [`Job`]: the capability contract every job implements
//! - [`InputSchema`]: declared inputs, checked before anything is dispatched
//! - [`JobRegistry`]: class path -> job code, refreshed from [`JobSource`]s

pub mod builtin;
pub mod job;
pub mod registry;
pub mod schema;

pub use job::{Job, JobArguments, JobContext, JobFailure, JobMeta, LogRecord, LogSink};
pub use registry::{JobRegistration, JobRegistry, JobSource, RefreshReport, StaticSource};
pub use schema::{InputSchema, VarKind, Variable};
