//! Analysis Engine Client
//!
//! The detection service is an opaque producer reached over HTTP. Every
//! call may fail or stall; callers bound it with a timeout and fall back to
//! locally synthesized metrics.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use classwatch_core::{ExternalAnalytics, ProducerMetrics};

use crate::ingest::IngestPipeline;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Engine timed out after {0:?}")]
    Timeout(Duration),
}

/// Narrow view of the detection service.
pub trait AnalysisEngine: Send + Sync {
    /// Current metrics for a running session.
    fn session_metrics<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<ProducerMetrics, EngineError>>;

    /// Stop the engine side of a session and collect its analytics, if any.
    fn complete_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalAnalytics>, EngineError>>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    metrics: ProducerMetrics,
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    #[serde(default)]
    analytics: Option<ExternalAnalytics>,
}

/// reqwest-backed engine client.
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl AnalysisEngine for HttpEngine {
    fn session_metrics<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<ProducerMetrics, EngineError>> {
        Box::pin(async move {
            let url = format!("{}/api/session/{}/status", self.base_url, session_id);
            let response = Self::check(self.client.get(&url).send().await?).await?;
            let body: StatusResponse = response.json().await?;
            Ok(body.metrics)
        })
    }

    fn complete_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalAnalytics>, EngineError>> {
        Box::pin(async move {
            let url = format!("{}/api/session/stop", self.base_url);
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "sessionId": session_id }))
                .send()
                .await?;
            let body: StopResponse = Self::check(response).await?.json().await?;
            Ok(body.analytics)
        })
    }
}

/// Poll the engine for every running session on a fixed period. Each
/// refresh is bounded by the pipeline's engine timeout and degrades on
/// failure.
pub fn spawn_poller(
    pipeline: Arc<IngestPipeline>,
    engine: Arc<dyn AnalysisEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("Engine poller stopping");
                    break;
                }
                _ = interval.tick() => {
                    let sessions = match pipeline.running_session_ids() {
                        Ok(ids) => ids,
                        Err(e) => {
                            tracing::warn!("Engine poll skipped: {}", e);
                            continue;
                        }
                    };
                    for session_id in sessions {
                        if let Err(e) = pipeline.refresh_from_engine(&session_id, engine.as_ref()).await {
                            tracing::debug!(session_id = %session_id, "Engine refresh rejected: {}", e);
                        }
                    }
                }
            }
        }
    })
}
