//! JSON-over-HTTP marketplace client
//!
//! Every operation is a POST to the configured endpoint with the operation
//! name in the `x-marketplace-action` header and a PascalCase JSON body.
//! List operations page with `NextToken` until the server stops returning one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::marketplace::client::{Assignment, Marketplace, MarketplaceError, TaskRequest, TaskSummary};

/// Production marketplace endpoint
pub const DEFAULT_ENDPOINT: &str = "https://mturk-requester.us-east-1.amazonaws.com";

/// Sandbox endpoint for trial runs
pub const SANDBOX_ENDPOINT: &str = "https://mturk-requester-sandbox.us-east-1.amazonaws.com";

/// Header carrying the operation name
const ACTION_HEADER: &str = "x-marketplace-action";

/// Page size requested from list operations
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct HttpMarketplaceConfig {
    pub endpoint: String,
    pub timeout: Duration,
    /// Environment variable holding the requester credential
    pub api_key_env: String,
}

impl Default for HttpMarketplaceConfig {
    fn default() -> Self {
        Self {
            endpoint: SANDBOX_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
            api_key_env: "WAVECROWD_API_KEY".to_string(),
        }
    }
}

pub struct HttpMarketplace {
    client: Client,
    api_key: String,
    config: HttpMarketplaceConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedTask {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateTaskResponse {
    task: CreatedTask,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskPage {
    #[serde(default)]
    tasks: Vec<TaskSummary>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssignmentPage {
    #[serde(default)]
    assignments: Vec<Assignment>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedQualification {
    qualification_type_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateQualificationResponse {
    qualification_type: CreatedQualification,
}

impl HttpMarketplace {
    /// Create a client, reading the credential from `config.api_key_env`
    pub fn new(config: HttpMarketplaceConfig) -> Result<Self, MarketplaceError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| MarketplaceError::MissingApiKey {
            var: config.api_key_env.clone(),
        })?;

        Self::with_api_key(api_key, config)
    }

    /// Create a client with an explicit credential
    pub fn with_api_key(api_key: String, config: HttpMarketplaceConfig) -> Result<Self, MarketplaceError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MarketplaceError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Build the CreateTask body
    fn build_create_task(&self, request: &TaskRequest) -> Result<Value, MarketplaceError> {
        serde_json::to_value(request).map_err(|e| MarketplaceError::InvalidResponse(format!("Unserializable request: {}", e)))
    }

    fn build_list_tasks(next_token: Option<&str>) -> Value {
        let mut body = json!({ "MaxResults": PAGE_SIZE });
        if let Some(token) = next_token {
            body["NextToken"] = json!(token);
        }
        body
    }

    fn build_list_assignments(task_id: &str, next_token: Option<&str>) -> Value {
        let mut body = json!({
            "TaskId": task_id,
            "MaxResults": PAGE_SIZE,
            "AssignmentStatuses": ["Submitted", "Approved", "Rejected"],
        });
        if let Some(token) = next_token {
            body["NextToken"] = json!(token);
        }
        body
    }

    /// Send one operation and decode the response body
    async fn send<T: DeserializeOwned>(&self, action: &str, body: Value) -> Result<T, MarketplaceError> {
        debug!(action, endpoint = %self.config.endpoint, "marketplace request");

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .header(ACTION_HEADER, action)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(MarketplaceError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MarketplaceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| MarketplaceError::InvalidResponse(format!("Failed to parse {} response: {}", action, e)))
    }
}

/// A connect failure never reached the server; anything else after the
/// request left may have been applied.
fn classify_send_error(e: reqwest::Error) -> MarketplaceError {
    if e.is_connect() || e.is_builder() {
        MarketplaceError::Unreachable(e.to_string())
    } else {
        MarketplaceError::Timeout(e.to_string())
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn create_task(&self, request: &TaskRequest) -> Result<String, MarketplaceError> {
        let body = self.build_create_task(request)?;
        let response: CreateTaskResponse = self.send("CreateTask", body).await?;
        Ok(response.task.task_id)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskSummary>, MarketplaceError> {
        let mut tasks = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page: TaskPage = self
                .send("ListTasks", Self::build_list_tasks(next_token.as_deref()))
                .await?;
            tasks.extend(page.tasks);
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        Ok(tasks)
    }

    async fn list_assignments_for_task(&self, task_id: &str) -> Result<Vec<Assignment>, MarketplaceError> {
        let mut assignments = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page: AssignmentPage = self
                .send(
                    "ListAssignmentsForTask",
                    Self::build_list_assignments(task_id, next_token.as_deref()),
                )
                .await?;
            assignments.extend(page.assignments);
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        Ok(assignments)
    }

    async fn create_qualification_type(&self, name: &str, description: &str) -> Result<String, MarketplaceError> {
        let body = json!({
            "Name": name,
            "Description": description,
            "QualificationTypeStatus": "Active",
        });
        let response: CreateQualificationResponse = self.send("CreateQualificationType", body).await?;
        Ok(response.qualification_type.qualification_type_id)
    }

    async fn assign_qualification(
        &self,
        qualification_id: &str,
        worker_id: &str,
        notify_worker: bool,
    ) -> Result<(), MarketplaceError> {
        let body = json!({
            "QualificationTypeId": qualification_id,
            "WorkerId": worker_id,
            "IntegerValue": 1,
            "SendNotification": notify_worker,
        });
        let _: Value = self.send("AssociateQualificationWithWorker", body).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.endpoint
    }
}

impl std::fmt::Debug for HttpMarketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMarketplace")
            .field("endpoint", &self.config.endpoint)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}
