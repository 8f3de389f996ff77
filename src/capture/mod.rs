//! Capture attempts and the per-camera scheduler that serializes them.

pub mod attempt;
pub mod scheduler;

pub use attempt::{CaptureRunner, PipelineRunner};
pub use scheduler::{CaptureScheduler, SchedulerReport};
