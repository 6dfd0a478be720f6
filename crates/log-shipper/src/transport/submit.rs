// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::constants::BACKPRESSURE_MARKER;
use crate::errors::SubmitError;
use crate::transport::packet::LogPacket;

/// Collector endpoint a packet is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Hot,
    Cold,
}

impl Port {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Port::Hot => "HotPort",
            Port::Cold => "ColdPort",
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote call delivering one packet to the collector.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, port: Port, packet: &LogPacket) -> Result<(), SubmitError>;
}

/// Maps a failed call to an error, recognizing saturation of the destination.
#[must_use]
pub fn classify_failure(status: Option<StatusCode>, message: String) -> SubmitError {
    let saturated = matches!(
        status,
        Some(StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE)
    ) || message.to_lowercase().contains(BACKPRESSURE_MARKER);

    if saturated {
        SubmitError::Backpressure(message)
    } else {
        SubmitError::Destination {
            status: status.map(|s| s.as_u16()),
            message,
        }
    }
}

/// Posts packets as JSON to `{base_url}/{port}/push`.
#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSubmitter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmitError::Destination {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, port: Port) -> String {
        format!("{}/{}/push", self.base_url, port)
    }
}

#[async_trait]
impl Submitter for HttpSubmitter {
    async fn submit(&self, port: Port, packet: &LogPacket) -> Result<(), SubmitError> {
        let body = serde_json::to_vec(packet).map_err(|e| SubmitError::Payload(e.to_string()))?;
        let url = self.endpoint(port);
        debug!("Submitting {} lines ({} bytes) to {}", packet.len(), body.len(), url);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| classify_failure(e.status(), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_failure(Some(status), text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_names() {
        assert_eq!(Port::Hot.to_string(), "HotPort");
        assert_eq!(Port::Cold.as_str(), "ColdPort");
    }

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure(Some(StatusCode::SERVICE_UNAVAILABLE), String::new()).is_backpressure());
        assert!(classify_failure(Some(StatusCode::TOO_MANY_REQUESTS), String::new()).is_backpressure());
        assert!(classify_failure(None, "Queue Is Full, try later".into()).is_backpressure());
        assert!(classify_failure(Some(StatusCode::INTERNAL_SERVER_ERROR), "queue is full".into())
            .is_backpressure());

        match classify_failure(Some(StatusCode::BAD_REQUEST), "malformed".into()) {
            SubmitError::Destination { status, message } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "malformed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!classify_failure(None, "connection refused".into()).is_backpressure());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let submitter =
            HttpSubmitter::new("http://localhost:8972/", Duration::from_secs(1)).expect("client");
        assert_eq!(submitter.endpoint(Port::Hot), "http://localhost:8972/HotPort/push");
    }
}
