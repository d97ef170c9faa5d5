//! Drives the yt-dlp executable as a subprocess: builds its command line,
//! streams its output as progress events, and keeps downloads and updates
//! from ever running at the same time.

// Argument vectors for the tool
pub mod command;
// Orchestrator settings
pub mod config;
// Download/update slots and background execution
pub mod coordinator;
mod error;
// Requests, outcomes and events exchanged with the UI
pub mod model;
// Percentage extraction from output lines
pub mod progress;
// Executable fetch and the update fallback chain
pub mod provision;
// Locating the executable
pub mod resolver;
// One subprocess with streaming and cancellation
pub mod session;

pub use config::OrchestratorConfig;
pub use coordinator::{Coordinator, OperationRequest, SessionHandle};
pub use error::{OrchestratorError, Result};
pub use model::{DownloadRequest, Operation, Outcome, Quality, SessionEvent, Terminal};
pub use progress::ProgressEvent;
