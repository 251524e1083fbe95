//! The three queue/bridge primitives that connect the poll loop to the
//! completion-queue actor.

pub mod bridge;
pub mod submission;
pub mod wakeup;

pub use bridge::EventBridge;
pub use submission::SubmissionQueue;
pub use wakeup::WakeupChannel;
