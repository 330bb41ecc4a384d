use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::PipelineError;
use crate::model::Content;

/// Job sent to the external processing worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingJob {
    pub image_id: String,
    pub version: String,

    /// Id of the event that requested processing
    pub event_id: String,

    /// The origin slide
    pub content: Content,
}

/// Boundary to the worker that renders thumbnails, DZI pyramids, tile
/// archives and index maps. The worker reports its results through an
/// `image_process_completed` event.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Run the job to completion. May take minutes.
    async fn process(&self, job: &ProcessingJob) -> Result<(), PipelineError>;
}

/// [`ImageProcessor`] that POSTs the job as JSON to a worker endpoint.
pub struct HttpImageProcessor {
    client: reqwest::Client,
    url: String,
}

impl HttpImageProcessor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::internal("build worker client", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ImageProcessor for HttpImageProcessor {
    async fn process(&self, job: &ProcessingJob) -> Result<(), PipelineError> {
        debug!(url = %self.url, image_id = %job.image_id, "Sending job to worker");

        let response = self
            .client
            .post(&self.url)
            .json(job)
            .send()
            .await
            .map_err(|e| PipelineError::internal("worker request", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::internal(
                format!("worker returned {status}"),
                body,
            ));
        }
        Ok(())
    }
}
