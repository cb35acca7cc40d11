//! License server contract.
//!
//! The server issues and revokes tokens. It is an external service; this
//! module defines what the client expects from it and, with the `online`
//! feature, an HTTPS implementation.
//!
//! Wire protocol (JSON, camelCase):
//!
//! - `POST {base}/activate` `{licenseKey, deviceFingerprint}`
//! - `POST {base}/revalidate` `{licenseId, deviceFingerprint}`
//!
//! `200` carries a [`LicenseToken`]. Any other status carries
//! `{"error": "invalid" | "revoked" | "rateLimited"}`.

use crate::device::DeviceFingerprint;
use crate::key::LicenseKey;
use crate::token::LicenseToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by (or while reaching) the license server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// The license key or license ID is not valid.
    #[error("license rejected by server")]
    Invalid,

    /// The license has been revoked.
    #[error("license revoked by server")]
    Revoked,

    /// Too many requests.
    #[error("rate limited by server")]
    RateLimited {
        /// Server-suggested wait, if any.
        retry_after: Option<Duration>,
    },

    /// Connect failure, timeout, or server-side error.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ServerError {
    /// Returns true if trying again later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::RateLimited { .. })
    }

    /// Returns the server-suggested wait for a rate-limit error.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Activation request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    /// Operator-entered key.
    pub license_key: String,
    /// Fingerprint to bind the token to.
    pub device_fingerprint: DeviceFingerprint,
}

/// Revalidation request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalidateRequest {
    /// License being renewed.
    pub license_id: String,
    /// Fingerprint to bind the renewed token to.
    pub device_fingerprint: DeviceFingerprint,
}

/// Error codes in a non-200 response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerErrorCode {
    /// See [`ServerError::Invalid`].
    Invalid,
    /// See [`ServerError::Revoked`].
    Revoked,
    /// See [`ServerError::RateLimited`].
    RateLimited,
}

/// Non-200 response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: ServerErrorCode,
}

/// Issues and renews license tokens.
#[async_trait]
pub trait LicenseServer: Send + Sync {
    /// Exchanges a license key for a token bound to `device`.
    async fn activate(
        &self,
        key: &LicenseKey,
        device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError>;

    /// Renews the token for `license_id`, or reports it revoked.
    async fn revalidate(
        &self,
        license_id: &str,
        device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError>;
}

/// A server that is never reachable. For fully offline runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineServer;

#[async_trait]
impl LicenseServer for OfflineServer {
    async fn activate(
        &self,
        _key: &LicenseKey,
        _device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError> {
        Err(ServerError::Unreachable("offline mode".to_string()))
    }

    async fn revalidate(
        &self,
        _license_id: &str,
        _device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError> {
        Err(ServerError::Unreachable("offline mode".to_string()))
    }
}

#[cfg(feature = "online")]
pub use http::HttpLicenseServer;

#[cfg(feature = "online")]
mod http {
    use super::{
        ActivateRequest, ErrorResponse, LicenseServer, RevalidateRequest, ServerError,
        ServerErrorCode,
    };
    use crate::device::DeviceFingerprint;
    use crate::error::{LicenseError, LicenseResult};
    use crate::key::LicenseKey;
    use crate::token::LicenseToken;
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode, Url};
    use serde::Serialize;
    use std::time::Duration;
    use tracing::{debug, warn};

    /// HTTPS client for the license server.
    #[derive(Debug, Clone)]
    pub struct HttpLicenseServer {
        base: Url,
        client: Client,
    }

    impl HttpLicenseServer {
        /// Creates a client for `base_url` with a per-request `timeout`.
        ///
        /// # Errors
        ///
        /// Returns [`LicenseError::Config`] for an unparseable URL, or a
        /// plain `http://` URL that does not point at loopback.
        pub fn new(base_url: &str, timeout: Duration) -> LicenseResult<Self> {
            let base = Url::parse(base_url.trim_end_matches('/'))
                .map_err(|e| LicenseError::Config(format!("invalid server url: {e}")))?;

            match base.scheme() {
                "https" => {}
                "http" if is_loopback(&base) => {}
                other => {
                    return Err(LicenseError::Config(format!(
                        "license server must use https, got {other}://"
                    )));
                }
            }

            let client = Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout)
                .user_agent(concat!("popwatch/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| LicenseError::Network(format!("http client: {e}")))?;

            Ok(Self { base, client })
        }

        fn endpoint(&self, path: &str) -> String {
            format!("{}/{path}", self.base.as_str().trim_end_matches('/'))
        }

        async fn post<B: Serialize + Sync>(
            &self,
            path: &str,
            body: &B,
        ) -> Result<LicenseToken, ServerError> {
            let url = self.endpoint(path);
            let request_id = uuid::Uuid::new_v4();
            debug!(%request_id, %url, "license server request");

            let resp = self
                .client
                .post(&url)
                .header("X-Request-Id", request_id.to_string())
                .json(body)
                .send()
                .await
                .map_err(|e| ServerError::Unreachable(format!("{path}: {e}")))?;

            let status = resp.status();
            if status == StatusCode::OK {
                return resp
                    .json::<LicenseToken>()
                    .await
                    .map_err(|e| ServerError::Protocol(format!("invalid token body: {e}")));
            }

            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);

            if status.is_server_error() {
                warn!(%request_id, %status, "license server error");
                return Err(ServerError::Unreachable(format!("HTTP {status}")));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ServerError::RateLimited { retry_after });
            }

            match resp.json::<ErrorResponse>().await {
                Ok(ErrorResponse { error: ServerErrorCode::Invalid }) => Err(ServerError::Invalid),
                Ok(ErrorResponse { error: ServerErrorCode::Revoked }) => Err(ServerError::Revoked),
                Ok(ErrorResponse { error: ServerErrorCode::RateLimited }) => {
                    Err(ServerError::RateLimited { retry_after })
                }
                Err(e) => Err(ServerError::Protocol(format!(
                    "HTTP {status} with unreadable body: {e}"
                ))),
            }
        }
    }

    fn is_loopback(url: &Url) -> bool {
        match url.host_str() {
            Some("localhost") => true,
            Some(host) => host
                .trim_matches(['[', ']'])
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback()),
            None => false,
        }
    }

    #[async_trait]
    impl LicenseServer for HttpLicenseServer {
        async fn activate(
            &self,
            key: &LicenseKey,
            device: &DeviceFingerprint,
        ) -> Result<LicenseToken, ServerError> {
            let body = ActivateRequest {
                license_key: key.expose().to_string(),
                device_fingerprint: device.clone(),
            };
            self.post("activate", &body).await
        }

        async fn revalidate(
            &self,
            license_id: &str,
            device: &DeviceFingerprint,
        ) -> Result<LicenseToken, ServerError> {
            let body = RevalidateRequest {
                license_id: license_id.to_string(),
                device_fingerprint: device.clone(),
            };
            self.post("revalidate", &body).await
        }
    }
}
