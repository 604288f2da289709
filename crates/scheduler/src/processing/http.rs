//! JSON-over-HTTP document processor client
//!
//! Endpoints, relative to the configured base URL:
//! - `GET    /health`
//! - `POST   /tasks`            -> `{"id": "..."}`
//! - `POST   /tasks/{id}/run`
//! - `GET    /tasks/{id}`       -> `{"started_at": ..., "finished_at": ...}`
//! - `DELETE /tasks/{id}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    DocumentProcessor, ExtractionRequest, ProcessorError, ReductionRequest, RemoteTaskRef,
    RemoteTaskStatus,
};

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CreateTaskBody<'a> {
    HierarchyExtraction {
        #[serde(flatten)]
        request: &'a ExtractionRequest,
    },
    Reduction {
        #[serde(flatten)]
        request: &'a ReductionRequest,
    },
}

#[derive(Deserialize)]
struct CreateTaskResponse {
    id: String,
}

/// HTTP client for the document processor
#[derive(Clone)]
pub struct HttpDocumentProcessor {
    client: Client,
    base_url: String,
}

impl HttpDocumentProcessor {
    /// Create a client for the processor at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProcessorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client with a preconfigured reqwest client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create_task(&self, body: CreateTaskBody<'_>) -> Result<RemoteTaskRef, ProcessorError> {
        let response = self
            .client
            .post(self.url("/tasks"))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let created: CreateTaskResponse = check(response, None)
            .await?
            .json()
            .await
            .map_err(|e| ProcessorError::InvalidResponse(e.to_string()))?;

        debug!(task = %created.id, "created remote task");
        Ok(RemoteTaskRef(created.id))
    }
}

#[async_trait]
impl DocumentProcessor for HttpDocumentProcessor {
    async fn ping(&self) -> Result<(), ProcessorError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProcessorError::Unavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    #[instrument(skip(self))]
    async fn create_extraction_task(
        &self,
        request: &ExtractionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError> {
        self.create_task(CreateTaskBody::HierarchyExtraction { request })
            .await
    }

    #[instrument(skip(self))]
    async fn create_reduction_task(
        &self,
        request: &ReductionRequest,
    ) -> Result<RemoteTaskRef, ProcessorError> {
        self.create_task(CreateTaskBody::Reduction { request }).await
    }

    async fn run(&self, task: &RemoteTaskRef) -> Result<(), ProcessorError> {
        let response = self
            .client
            .post(self.url(&format!("/tasks/{}/run", task)))
            .send()
            .await
            .map_err(unavailable)?;

        check(response, Some(task)).await?;
        Ok(())
    }

    async fn get_status(&self, task: &RemoteTaskRef) -> Result<RemoteTaskStatus, ProcessorError> {
        let response = self
            .client
            .get(self.url(&format!("/tasks/{}", task)))
            .send()
            .await
            .map_err(unavailable)?;

        check(response, Some(task))
            .await?
            .json()
            .await
            .map_err(|e| ProcessorError::InvalidResponse(e.to_string()))
    }

    async fn delete(&self, task: &RemoteTaskRef) -> Result<bool, ProcessorError> {
        let response = self
            .client
            .delete(self.url(&format!("/tasks/{}", task)))
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => {
                check(response, Some(task)).await?;
                Ok(true)
            }
        }
    }
}

fn unavailable(e: reqwest::Error) -> ProcessorError {
    ProcessorError::Unavailable(e.to_string())
}

/// Map non-success responses to processor errors
async fn check(
    response: Response,
    task: Option<&RemoteTaskRef>,
) -> Result<Response, ProcessorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        if let Some(task) = task {
            return Err(ProcessorError::TaskNotFound(task.clone()));
        }
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(ProcessorError::Unavailable(format!("{status}: {body}")))
    } else {
        Err(ProcessorError::Rejected(format!("{status}: {body}")))
    }
}
