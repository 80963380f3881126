//! Service modules for batch orchestration

pub mod broadcaster;
pub mod classifier;
pub mod dispatcher;
pub mod orchestrator;
pub mod pacing;
pub mod registry;

pub use broadcaster::ProgressBroadcaster;
pub use classifier::{Classifier, ClassifyError, HttpClassifier};
pub use dispatcher::{ChunkDispatcher, DispatchSettings, RetryPolicy};
pub use orchestrator::{BatchOrchestrator, RecoveryReport, Submission};
pub use pacing::PacingPolicy;
pub use registry::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, RegistryConfig, SweepReport,
    Transport,
};
