//! Response envelope shared by the public API and the peer-to-peer routes
//!
//! ```json
//! {"result": <payload or null>, "status": {"error": "..."}, "time": 0.002}
//! ```
//!
//! `status` is `{}` on success. Peers read each other's responses through
//! [`read_response`], which turns a non-2xx answer back into an error of the
//! same class.

use crate::common::{Error, ErrorClass, FailureCause, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub result: Option<T>,
    pub status: ApiStatus,
    /// Handling time in seconds
    pub time: f64,
}

impl<T> ApiResponse<T> {
    pub fn ok(result: T, elapsed: Duration) -> Self {
        Self {
            result: Some(result),
            status: ApiStatus::default(),
            time: elapsed.as_secs_f64(),
        }
    }

    pub fn error(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            result: None,
            status: ApiStatus {
                error: Some(message.into()),
            },
            time: elapsed.as_secs_f64(),
        }
    }
}

/// Decode an enveloped response from another peer.
pub async fn read_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.bytes().await?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ApiResponse<serde_json::Value>>(&body)
            .ok()
            .and_then(|envelope| envelope.status.error)
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        return Err(Error::Remote(FailureCause::new(
            ErrorClass::from_http_status(status),
            message,
        )));
    }

    let envelope: ApiResponse<T> = serde_json::from_slice(&body)?;
    envelope
        .result
        .ok_or_else(|| Error::Http(format!("empty result in {} response", status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ApiResponse::ok(true, Duration::from_millis(2))).unwrap();
        assert_eq!(ok["result"], true);
        assert_eq!(ok["status"], serde_json::json!({}));

        let err = serde_json::to_value(ApiResponse::<()>::error(
            "Wrong input: bad",
            Duration::ZERO,
        ))
        .unwrap();
        assert!(err["result"].is_null());
        assert_eq!(err["status"]["error"], "Wrong input: bad");
        assert_eq!(err["time"], 0.0);
    }
}
