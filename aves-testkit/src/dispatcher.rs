use std::sync::Arc;

use async_trait::async_trait;
use aves::*;
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub task: ControlTask,
}

/// Dispatcher that records tasks and answers with a configurable status.
#[derive(Clone)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    result: Arc<Mutex<DispatchStatus>>,
    housekeeping: Arc<Mutex<usize>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::with_result(DispatchStatus::Success)
    }

    pub fn with_result(result: DispatchStatus) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(result)),
            housekeeping: Arc::new(Mutex::new(0)),
        }
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(actual, expected, "Expected {expected} dispatches, got {actual}");
    }

    pub fn set_result(&self, result: DispatchStatus) {
        *self.result.lock() = result;
    }

    pub fn housekeeping_runs(&self) -> usize {
        *self.housekeeping.lock()
    }

    pub fn clear(&self) {
        self.dispatches.lock().clear();
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDispatcher for MockDispatcher {
    async fn dispatch(&self, task: &ControlTask) -> DispatchStatus {
        self.dispatches.lock().push(DispatchRecord { task: task.clone() });
        self.result.lock().clone()
    }

    async fn housekeep(&self) -> anyhow::Result<()> {
        *self.housekeeping.lock() += 1;
        Ok(())
    }
}
