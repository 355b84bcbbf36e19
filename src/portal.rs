//! Signed HTTP client for the portal API.
//!
//! Requests carry the device identity headers plus an HMAC signature over
//! `"{timestamp}.{body}"`. The body is sent as the exact canonical JSON string
//! that was signed. Every failure mode (network, timeout, non-2xx status,
//! decode failure, `success: false`) comes back as a tagged [`TransportError`]
//! so the delivery worker has a single nack decision site.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use snafu::Snafu;
use url::Url;

use crate::clock::Clock;
use crate::error::Error;
use crate::message::canonical_json;
use crate::signer::Signer;

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("request timed out"))]
    Timeout,

    #[snafu(display("HTTP {status}: {body}"))]
    Status { status: u16, body: String },

    #[snafu(display("invalid response body: {source}"))]
    Decode { source: reqwest::Error },

    #[snafu(display("{error}"))]
    Rejected { error: String },
}

/// Portal response envelope: `{"success": true, "ack_id"?: ..}` on success,
/// `{"success": false, "error": ..}` otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub ack_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ApiResponse {
    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("success".into(), Value::Bool(self.success));
        if let Some(ack_id) = &self.ack_id {
            map.insert("ack_id".into(), Value::String(ack_id.clone()));
        }
        if let Some(error) = &self.error {
            map.insert("error".into(), Value::String(error.clone()));
        }
        Value::Object(map)
    }
}

pub struct PortalClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    device_id: String,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
}

impl PortalClient {
    pub fn new(
        base_url: Url,
        api_key: String,
        device_id: String,
        timeout: std::time::Duration,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(eyre::eyre!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            device_id,
            signer,
            clock,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::Rejected {
                error: format!("invalid endpoint {path}: {e}"),
            })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, TransportError> {
        let response = request.send().await.map_err(|source| {
            if source.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network { source }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|source| TransportError::Decode { source })?;

        if !parsed.success {
            return Err(TransportError::Rejected {
                error: parsed
                    .error
                    .unwrap_or_else(|| "server reported failure".to_string()),
            });
        }

        Ok(parsed)
    }

    /// POSTs a signed canonical-JSON body. Detection deliveries additionally
    /// pass their message id for the `X-Message-ID` header.
    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        message_id: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(path)?;
        let payload = canonical_json(body).map_err(|e| TransportError::Rejected {
            error: format!("unserializable payload: {e}"),
        })?;
        let timestamp = self.clock.now() as i64;
        let signature = self.signer.sign(timestamp, &payload);

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-API-Key", &self.api_key)
            .header("X-Device-ID", &self.device_id)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .body(payload);

        if let Some(id) = message_id {
            request = request.header("X-Message-ID", id);
        }

        self.execute(request).await
    }

    async fn get(&self, path: &str) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(path)?;
        let timestamp = self.clock.now() as i64;
        let signature = self.signer.sign(timestamp, "");

        let request = self
            .http
            .get(url)
            .header("X-API-Key", &self.api_key)
            .header("X-Device-ID", &self.device_id)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature);

        self.execute(request).await
    }

    pub async fn register_device(&self, info: &Value) -> Result<ApiResponse, TransportError> {
        self.post("/devices/register", info, None).await
    }

    pub async fn send_heartbeat(&self, body: &Value) -> Result<ApiResponse, TransportError> {
        self.post("/devices/heartbeat", body, None).await
    }

    pub async fn send_detection(
        &self,
        event_id: &str,
        body: &Value,
    ) -> Result<ApiResponse, TransportError> {
        self.post("/devices/detections", body, Some(event_id)).await
    }

    pub async fn send_detection_batch(&self, body: &Value) -> Result<ApiResponse, TransportError> {
        self.post("/devices/detections/batch", body, None).await
    }

    pub async fn check_health(&self) -> Result<ApiResponse, TransportError> {
        self.get("/api/health").await
    }

    pub async fn fetch_device_config(&self) -> Result<ApiResponse, TransportError> {
        let path = format!("/devices/{}/config", self.device_id);
        self.get(&path).await
    }

    pub async fn report_update_status(&self, body: &Value) -> Result<ApiResponse, TransportError> {
        self.post("/devices/update-status", body, None).await
    }

    pub async fn report_update_result(&self, body: &Value) -> Result<ApiResponse, TransportError> {
        self.post("/devices/update-result", body, None).await
    }
}
