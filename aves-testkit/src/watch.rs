use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aves::*;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

enum Script {
    Events(Vec<WatchEvent>),
    OpenError(String),
}

/// Watch source replaying scripted connections.
///
/// Each `open` takes the next script: a batch of events after which the
/// stream ends, or an open failure. Once the scripts run out the stream
/// stays open and idle.
#[derive(Clone)]
pub struct ScriptedWatchSource {
    name: String,
    scripts: Arc<Mutex<VecDeque<Script>>>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedWatchSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn then_events(self, events: Vec<WatchEvent>) -> Self {
        self.scripts.lock().push_back(Script::Events(events));
        self
    }

    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.scripts.lock().push_back(Script::OpenError(message.into()));
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatchSource for ScriptedWatchSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<WatchEvent>>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.scripts.lock().pop_front() {
            Some(Script::Events(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Some(Script::OpenError(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(stream::pending().boxed()),
        }
    }
}
