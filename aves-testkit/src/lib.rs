//! Test doubles and fixtures shared by the aves integration tests and
//! benches.

mod dispatcher;
mod fixtures;
mod orchestrator;
mod reporter;
mod watch;

pub use dispatcher::{DispatchRecord, MockDispatcher};
pub use fixtures::*;
pub use orchestrator::{MockOrchestrator, OrchestratorCall, StoredObject};
pub use reporter::RecordingReporter;
pub use watch::ScriptedWatchSource;
