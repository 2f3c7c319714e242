// src/lib.rs

// Import the top-level `council` module.
pub mod council;

// Re-exporting key items for easier external access.
pub use council::orchestrator::CouncilOrchestrator;
pub use council::provider::{ChatMessage, Completion, Provider, Role, StreamChunk};

/// Initialise the process-wide logger once; safe to call repeatedly (tests).
pub fn init_logger() {
    let _ = env_logger::builder().try_init();
}
