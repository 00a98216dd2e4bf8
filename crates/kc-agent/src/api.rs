//! Control-plane HTTP client: heartbeat, registration and unregistration.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use std::time::Duration;

use kc_common::{AgentError, AgentResult};
use kc_protocol::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, HEARTBEAT_PATH,
    REGISTER_PATH, UNREGISTER_PATH,
};

use crate::state::{Credential, HeartbeatResult};

/// Throttle used when a 429 carries no usable `Retry-After`.
const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);
/// Longest throttle honoured from a `Retry-After` header.
pub const MAX_THROTTLE: Duration = Duration::from_secs(3_600);

/// Sends one heartbeat and returns the server's policy.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn heartbeat(
        &self,
        credential: &Credential,
        request: &HeartbeatRequest,
    ) -> AgentResult<HeartbeatResult>;
}

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("kc-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Provision this device. Returns the issued credential.
    pub async fn register(&self, request: &RegisterRequest) -> anyhow::Result<Credential> {
        let resp = self
            .http
            .post(self.url(REGISTER_PATH))
            .json(request)
            .send()
            .await
            .context("Failed to send register request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Register failed ({}): {}", status, body);
        }

        let body: RegisterResponse = resp
            .json()
            .await
            .context("Failed to parse register response")?;

        match body.data {
            Some(data) if body.success => Credential::new(data.device_id, data.token)
                .context("Server returned an empty device credential"),
            _ => anyhow::bail!(
                "Register rejected: {}",
                body.message.unwrap_or_else(|| "no reason given".into())
            ),
        }
    }

    pub async fn unregister(&self, credential: &Credential) -> anyhow::Result<()> {
        let resp = self
            .http
            .delete(self.url(UNREGISTER_PATH))
            .bearer_auth(&credential.token)
            .header("X-Device-Id", &credential.device_id)
            .send()
            .await
            .context("Failed to send unregister request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Unregister failed ({}): {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl HeartbeatTransport for ControlPlaneClient {
    async fn heartbeat(
        &self,
        credential: &Credential,
        request: &HeartbeatRequest,
    ) -> AgentResult<HeartbeatResult> {
        let resp = self
            .http
            .post(self.url(HEARTBEAT_PATH))
            .bearer_auth(&credential.token)
            .header("X-Device-Id", &credential.device_id)
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, body));
        }

        let body: HeartbeatResponse = resp.json().await?;
        parse_heartbeat(body)
    }
}

fn classify_send_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout
    } else if e.is_connect() {
        AgentError::Transport(e.to_string())
    } else {
        AgentError::Http(e)
    }
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_THROTTLE))
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: String) -> AgentError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Unauthorized(body),
        StatusCode::TOO_MANY_REQUESTS => {
            AgentError::Throttled(retry_after.unwrap_or(DEFAULT_THROTTLE))
        }
        _ => AgentError::Server {
            status: status.as_u16(),
            message: body,
        },
    }
}

fn parse_heartbeat(body: HeartbeatResponse) -> AgentResult<HeartbeatResult> {
    if !body.success {
        return Err(AgentError::Server {
            status: 200,
            message: body.message.unwrap_or_else(|| "heartbeat rejected".into()),
        });
    }

    // success without data: remote control off, reconnect allowed
    Ok(body.data.map(HeartbeatResult::from).unwrap_or(HeartbeatResult {
        remote_control_enabled: false,
        should_reconnect: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> HeartbeatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn heartbeat_policy_is_read_from_data() {
        let result = parse_heartbeat(response(
            r#"{"success":true,"data":{"remote_control_enabled":true,"should_reconnect":false}}"#,
        ))
        .unwrap();
        assert!(result.remote_control_enabled);
        assert!(!result.should_reconnect);
    }

    #[test]
    fn unsuccessful_body_is_a_server_error() {
        let err = parse_heartbeat(response(r#"{"success":false,"message":"device disabled"}"#))
            .unwrap_err();
        assert!(matches!(err, AgentError::Server { ref message, .. } if message == "device disabled"));
    }

    #[test]
    fn success_without_data_allows_reconnect() {
        let result = parse_heartbeat(response(r#"{"success":true}"#)).unwrap();
        assert!(result.should_reconnect);
        assert!(!result.remote_control_enabled);
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, "bad token".into()),
            AgentError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(30)),
                String::new()
            ),
            AgentError::Throttled(d) if d == Duration::from_secs(30)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, None, String::new()).is_retryable());
        assert!(!status_error(StatusCode::NOT_FOUND, None, String::new()).is_retryable());
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, None, String::new()),
            AgentError::Throttled(d) if d == DEFAULT_THROTTLE
        ));
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("120"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(
            header::RETRY_AFTER,
            header::HeaderValue::from_static("18446744073709551615"),
        );
        assert_eq!(retry_after(&headers), Some(MAX_THROTTLE));

        headers.insert(
            header::RETRY_AFTER,
            header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ControlPlaneClient::new("https://mdm.example.com/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            client.url(HEARTBEAT_PATH),
            "https://mdm.example.com/api/devices/heartbeat"
        );
    }
}
