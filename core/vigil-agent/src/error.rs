use thiserror::Error;
use vigil_core::VigilError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] VigilError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Reconcile worker panicked")]
    WorkerPanicked,
}
