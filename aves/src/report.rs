//! Outbound status reports for jobs submitted with `needReport`.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ReportConfig;
use crate::job::JobStatus;

/// Body posted to the report endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Caller-supplied job id.
    pub job_id: String,
    pub status: JobStatus,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl StatusReport {
    pub fn job(job_id: impl Into<String>, status: JobStatus, msg: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            msg: msg.into(),
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }
}

/// Fire-and-forget delivery of status reports.
///
/// `report` returns once the report is handed off; delivery failures are
/// logged, never surfaced to the state machine.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, report: StatusReport, token: Option<String>) -> anyhow::Result<()>;
}

/// Drops every report.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStatusReporter;

#[async_trait]
impl StatusReporter for NoopStatusReporter {
    async fn report(&self, report: StatusReport, _token: Option<String>) -> anyhow::Result<()> {
        tracing::trace!(job_id = %report.job_id, status = %report.status, "status report dropped");
        Ok(())
    }
}

/// Posts reports as JSON with the job's bearer token.
#[derive(Clone)]
pub struct HttpStatusReporter {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    retry_interval: Duration,
}

impl fmt::Debug for HttpStatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStatusReporter")
            .field("endpoint", &self.endpoint)
            .field("max_attempts", &self.max_attempts)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

/// How a single delivery attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// The endpoint answered with an error status; not retried.
    Rejected(u16),
    /// Connection-level failure; retried.
    Unreachable(String),
}

impl HttpStatusReporter {
    pub fn new(endpoint: impl Into<String>, config: &ReportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            max_attempts: config.max_attempts.max(1),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
        })
    }

    /// Reporter for `config`, or `None` when no endpoint is configured.
    pub fn from_config(config: &ReportConfig) -> anyhow::Result<Option<Self>> {
        config
            .endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| Self::new(endpoint, config))
            .transpose()
    }

    async fn attempt(&self, report: &StatusReport, token: Option<&str>) -> Delivery {
        let mut request = self.client.post(&self.endpoint).json(report);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_client_error() || response.status().is_server_error() => {
                Delivery::Rejected(response.status().as_u16())
            }
            Ok(_) => Delivery::Delivered,
            Err(err) => Delivery::Unreachable(err.to_string()),
        }
    }

    /// Deliver with bounded retries; returns whether the endpoint accepted
    /// the report.
    pub async fn deliver(&self, report: &StatusReport, token: Option<&str>) -> bool {
        for attempt in 1..=self.max_attempts {
            match self.attempt(report, token).await {
                Delivery::Delivered => {
                    tracing::debug!(job_id = %report.job_id, status = %report.status, "status report sent");
                    return true;
                }
                Delivery::Rejected(code) => {
                    tracing::warn!(job_id = %report.job_id, code, "status report rejected");
                    return false;
                }
                Delivery::Unreachable(error) => {
                    tracing::warn!(
                        job_id = %report.job_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "status report failed"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        false
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(&self, report: StatusReport, token: Option<String>) -> anyhow::Result<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            reporter.deliver(&report, token.as_deref()).await;
        });
        Ok(())
    }
}
