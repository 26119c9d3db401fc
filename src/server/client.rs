//! HTTP client for a remote queue server.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, Result};
use crate::scheduler::assigner::DequeueResult;
use crate::scheduler::bucket::{BucketId, JobId, TestingResult, WorkerCapability, WorkerId};
use crate::scheduler::job::{JobResults, JobState};
use crate::server::connection::{
    DequeueRequest, ErrorBody, QueueConnection, QueueStateReport, RegisterWorkerRequest,
    ReportAliveRequest, ReportResultOutcome, ReportResultRequest, ScheduleTestsRequest,
    ScheduleTestsResponse, WorkerConfiguration,
};
use crate::worker::aliveness::WorkerStatusReport;

#[derive(Debug, Clone)]
pub struct QueueClient {
    base_url: String,
    http: reqwest::Client,
}

impl QueueClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn non-2xx answers into [`QueueError::Remote`] with the server's message.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(QueueError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_no_content<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl QueueConnection for QueueClient {
    async fn schedule_tests(&self, request: ScheduleTestsRequest) -> Result<ScheduleTestsResponse> {
        self.post_json("/api/jobs", &request).await
    }

    async fn register_worker(&self, worker_id: &WorkerId) -> Result<WorkerConfiguration> {
        self.post_json(
            "/api/workers/register",
            &RegisterWorkerRequest {
                worker_id: worker_id.clone(),
            },
        )
        .await
    }

    async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        capabilities: &[WorkerCapability],
    ) -> Result<DequeueResult> {
        self.post_json(
            "/api/workers/dequeue",
            &DequeueRequest {
                worker_id: worker_id.clone(),
                capabilities: capabilities.to_vec(),
            },
        )
        .await
    }

    async fn report_alive(&self, worker_id: &WorkerId, bucket_ids: Vec<BucketId>) -> Result<()> {
        self.post_no_content(
            "/api/workers/alive",
            &ReportAliveRequest {
                worker_id: worker_id.clone(),
                bucket_ids_being_processed: bucket_ids,
            },
        )
        .await
    }

    async fn report_result(
        &self,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<ReportResultOutcome> {
        self.post_json(
            "/api/workers/result",
            &ReportResultRequest {
                worker_id: worker_id.clone(),
                testing_result,
            },
        )
        .await
    }

    async fn job_state(&self, job_id: &JobId) -> Result<JobState> {
        self.get_json(&format!("/api/jobs/{}/state", job_id)).await
    }

    async fn job_results(&self, job_id: &JobId) -> Result<JobResults> {
        self.get_json(&format!("/api/jobs/{}/results", job_id)).await
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/api/jobs/{}", job_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(QueueError::JobNotFound(job_id.clone()));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn block_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.post_no_content(&format!("/api/workers/{}/block", worker_id), &())
            .await
    }

    async fn queue_state(&self) -> Result<QueueStateReport> {
        self.get_json("/api/queue").await
    }

    async fn worker_statuses(&self) -> Result<Vec<WorkerStatusReport>> {
        self.get_json("/api/workers").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = QueueClient::new("http://localhost:41000/");
        assert_eq!(client.base_url(), "http://localhost:41000");
        assert_eq!(client.url("/api/queue"), "http://localhost:41000/api/queue");
    }
}
