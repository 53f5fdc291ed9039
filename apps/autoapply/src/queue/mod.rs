pub mod dedup;
pub mod engine;

pub use engine::{ApplyQueue, BatchReport, EnqueueOutcome, QueueError};
