//! HTTP clients for the check-in backend.
//!
//! [`ApiClient`] is the thin JSON POST wrapper with the fixed header set the
//! backend expects. [`RecognitionClient`] layers the two product endpoints on
//! top of it: face-recognition check-in and the status update that completes
//! a successful office check-in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const MAX_LOGGED_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
}

/// JSON POST with the backend's fixed headers and the shared secret key.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    secret_key: String,
}

impl ApiClient {
    pub fn new(timeout: Duration, secret_key: String) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, secret_key })
    }

    pub fn from_env() -> Result<Self, ApiError> {
        let secret_key = std::env::var("SECRET_KEY").unwrap_or_default();
        Self::new(Duration::from_secs(30), secret_key)
    }

    /// POST a JSON body and return the status code with the raw response
    /// body. Callers decide what a non-2xx means.
    pub async fn post_json(&self, endpoint: &str, body: &Value) -> Result<(u16, String), ApiError> {
        let response = self
            .client
            .post(endpoint)
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", "vi,en-US;q=0.9,en;q=0.8")
            .header("Cache-Control", "no-cache")
            .header("X-Secret-Key", &self.secret_key)
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if (200..300).contains(&status) {
            debug!(endpoint, status, "api call succeeded");
        } else {
            warn!(endpoint, status, body = %truncate(&text), "api call failed");
        }
        Ok((status, text))
    }
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_LOGGED_BODY {
        return body;
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[derive(Debug, Serialize)]
struct CheckInRequest {
    #[serde(rename = "userId")]
    user_id: i64,
    imgs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateStatusRequest {
    #[serde(rename = "userId")]
    user_id: i64,
    status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecognitionResponse {
    #[serde(rename = "facialRecognitionStatus")]
    pub facial_recognition_status: String,
    #[serde(rename = "imageVerifyId")]
    pub image_verify_id: String,
    #[serde(rename = "employeeId")]
    pub employee_id: String,
    #[serde(rename = "accountEmployeeId")]
    pub account_employee_id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub shifts: Vec<Value>,
    #[serde(rename = "lastClockEventDTO")]
    pub last_clock_event: Option<LastClockEvent>,
    #[serde(rename = "identityVerified")]
    pub identity_verified: bool,
    pub probability: f64,
    #[serde(rename = "showMessage")]
    pub show_message: bool,
    #[serde(rename = "isWFH")]
    pub is_wfh: bool,
}

impl RecognitionResponse {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastClockEvent {
    pub clock_id: String,
    pub shift_id: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub last_break: Option<String>,
}

/// The transport seam, mockable in tests.
#[async_trait]
trait RecognitionBackend: Send + Sync {
    async fn post(&self, endpoint: &str, body: Value) -> Result<(u16, String), ApiError>;
}

#[async_trait]
impl RecognitionBackend for ApiClient {
    async fn post(&self, endpoint: &str, body: Value) -> Result<(u16, String), ApiError> {
        self.post_json(endpoint, &body).await
    }
}

/// Client for the check-in and status-update endpoints.
#[derive(Clone)]
pub struct RecognitionClient {
    backend: Arc<dyn RecognitionBackend>,
    check_in_url: String,
    update_status_url: String,
}

impl RecognitionClient {
    pub fn new(api: ApiClient, base_url: &str) -> Result<Self, ApiError> {
        if base_url.is_empty() {
            return Err(ApiError::InvalidConfig("BASE_URL is not set".into()));
        }
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            backend: Arc::new(api),
            check_in_url: format!("{base}/employees/bot/check-in"),
            update_status_url: format!("{base}/employees/bot/update-status"),
        })
    }

    #[cfg(test)]
    fn with_backend(backend: Arc<dyn RecognitionBackend>) -> Self {
        Self {
            backend,
            check_in_url: "http://mock/employees/bot/check-in".into(),
            update_status_url: "http://mock/employees/bot/update-status".into(),
        }
    }

    /// Submit one or more base64 JPEG crops for identity verification.
    pub async fn check_in(
        &self,
        user_id: i64,
        images: Vec<String>,
    ) -> Result<RecognitionResponse, ApiError> {
        let body = serde_json::to_value(CheckInRequest {
            user_id,
            imgs: images,
        })?;
        let (status, text) = self.backend.post(&self.check_in_url, body).await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Status {
                status,
                body: truncate(&text).to_string(),
            });
        }
        let result: RecognitionResponse = serde_json::from_str(&text)?;
        info!(
            employee = %result.full_name(),
            status = %result.facial_recognition_status,
            verified = result.identity_verified,
            probability = result.probability,
            wfh = result.is_wfh,
            "recognition result"
        );
        if let Some(event) = &result.last_clock_event {
            debug!(start_time = %event.start_time, "last clock event");
        }
        Ok(result)
    }

    /// Mark the user approved after a valid office location.
    pub async fn update_status(&self, user_id: i64, status: &str) -> Result<(), ApiError> {
        let body = serde_json::to_value(UpdateStatusRequest {
            user_id,
            status: status.to_string(),
        })?;
        let (code, text) = self.backend.post(&self.update_status_url, body).await?;
        if !(200..300).contains(&code) {
            return Err(ApiError::Status {
                status: code,
                body: truncate(&text).to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CannedBackend {
        status: u16,
        body: String,
        requests: Mutex<Vec<(String, Value)>>,
    }

    impl CannedBackend {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RecognitionBackend for CannedBackend {
        async fn post(&self, endpoint: &str, body: Value) -> Result<(u16, String), ApiError> {
            self.requests.lock().push((endpoint.to_string(), body));
            Ok((self.status, self.body.clone()))
        }
    }

    #[tokio::test]
    async fn check_in_parses_recognition_fields() {
        let backend = CannedBackend::new(
            200,
            r#"{
                "facialRecognitionStatus": "MATCHED",
                "imageVerifyId": "iv-1",
                "employeeId": "e-9",
                "firstName": "Minh",
                "lastName": "Nguyen",
                "identityVerified": true,
                "probability": 0.97,
                "isWFH": false,
                "lastClockEventDTO": {"clockId": "c1", "shiftId": null, "startTime": "2024-01-02T08:00:00Z", "endTime": null, "lastBreak": null}
            }"#,
        );
        let client = RecognitionClient::with_backend(backend.clone());
        let result = client.check_in(77, vec!["abc".into()]).await.unwrap();
        assert!(result.identity_verified);
        assert!(!result.is_wfh);
        assert_eq!(result.full_name(), "Minh Nguyen");
        assert_eq!(result.last_clock_event.unwrap().clock_id, "c1");

        let requests = backend.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1["userId"], 77);
        assert_eq!(requests[0].1["imgs"][0], "abc");
    }

    #[tokio::test]
    async fn check_in_surfaces_non_2xx_with_body() {
        let backend = CannedBackend::new(403, "secret key rejected");
        let client = RecognitionClient::with_backend(backend);
        match client.check_in(1, vec![]).await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "secret key rejected");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_status_posts_approved() {
        let backend = CannedBackend::new(200, "{}");
        let client = RecognitionClient::with_backend(backend.clone());
        client.update_status(42, "APPROVED").await.unwrap();
        let requests = backend.requests.lock();
        assert!(requests[0].0.ends_with("/employees/bot/update-status"));
        assert_eq!(requests[0].1["userId"], 42);
        assert_eq!(requests[0].1["status"], "APPROVED");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("short"), "short");
        let long = "á".repeat(600);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_LOGGED_BODY);
        assert!(long.starts_with(cut));
    }
}
