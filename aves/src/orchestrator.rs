//! Capabilities consumed from the container orchestrator.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::OrchestratorError;
use crate::manifest::{LabelSelector, Manifest, ResourceKind};
use crate::reconcile::WatchEvent;

/// Create/delete/list of the object kinds a job is made of.
///
/// Calls are plain RPCs bounded by the client's own timeout.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create(&self, namespace: &str, manifest: &Manifest) -> Result<(), OrchestratorError>;

    /// Delete every object of `kind` matching `selector`; nothing matching is
    /// not an error.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), OrchestratorError>;

    /// Names of the objects of `kind` matching `selector`.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<String>, OrchestratorError>;
}

/// One long-lived stream of decoded orchestrator events.
///
/// The stream ends or yields an error when the connection drops; the
/// runtime reopens it with backoff.
#[async_trait]
pub trait WatchSource: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<WatchEvent>>>;
}
