pub mod commands;
pub mod orchestrator;
pub mod snapshot;

pub use commands::{dispatch, CommandReply, SessionCommand};
pub use orchestrator::SessionOrchestrator;
pub use snapshot::{CaptureErrorView, SessionSnapshot};
