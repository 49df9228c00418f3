pub mod beat;
pub mod recurrence;

pub use beat::{Beat, TickReport};
pub use recurrence::{CronSchedule, Recurrence};
