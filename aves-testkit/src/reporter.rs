use std::sync::Arc;

use async_trait::async_trait;
use aves::*;
use parking_lot::Mutex;

/// Reporter that keeps every report with the token it was sent with.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<(StatusReport, Option<String>)>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().iter().map(|(report, _)| report.clone()).collect()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.reports.lock().iter().map(|(_, token)| token.clone()).collect()
    }

    /// Job-level statuses in the order they were reported.
    pub fn job_statuses(&self) -> Vec<JobStatus> {
        self.reports
            .lock()
            .iter()
            .filter(|(report, _)| report.worker.is_none())
            .map(|(report, _)| report.status)
            .collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, report: StatusReport, token: Option<String>) -> anyhow::Result<()> {
        self.reports.lock().push((report, token));
        Ok(())
    }
}
