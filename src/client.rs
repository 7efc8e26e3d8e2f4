//! Blocking HTTP client for the fermentation controller's read endpoints.
//!
//! - Blocking client using `ureq` (no async); callers that must not block run it on a worker thread.
//! - Covers only what the dashboard sync needs: the dashboard snapshot, per-batch temperature logs and
//!   the CSV export. CRUD endpoints are not modelled.
//!
//! Authentication
//! - Optional bearer token. Open-access deployments run without one.

use http::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{DecodeError, SyncError};
use crate::models::fermentation::{BatchId, BatchStatusSnapshot, TemperatureLogPoint};
use crate::utils::decode_json;

/// Exports are pass-through blobs; allow more than ureq's default body limit.
const EXPORT_BODY_LIMIT: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, message: String },
    Decode(DecodeError),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Decode(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<DecodeError> for ClientError {
    fn from(value: DecodeError) -> Self {
        ClientError::Decode(value)
    }
}

impl From<ureq::Error> for ClientError {
    fn from(value: ureq::Error) -> Self {
        ClientError::Transport(value.to_string())
    }
}

impl From<ClientError> for SyncError {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::Decode(e) => SyncError::Decode(e),
            other => SyncError::Network(other.to_string()),
        }
    }
}

pub struct FermenterClient {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl FermenterClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        FermenterClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn get(&self, path: &str, accept: &str, query: &[(&str, String)]) -> Result<http::Response<ureq::Body>, ClientError> {
        let mut req = self.agent.get(&self.url(path)).header("Accept", accept);
        for (k, v) in query {
            req = req.query(*k, v);
        }
        if let Some(token) = self.token.as_deref() {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let mut res = req.call()?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let body = res
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        let message = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("{} (is FERMENT_API_TOKEN set correctly?)", body)
            }
            _ => body,
        };
        Err(ClientError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ClientError> {
        let mut res = self.get(path, "application/json", query)?;
        let text = res.body_mut().read_to_string()?;
        Ok(decode_json(path, &text)?)
    }

    pub fn get_dashboard(&self) -> Result<Vec<BatchStatusSnapshot>, ClientError> {
        self.get_json("/dashboard/", &[])
    }

    /// Temperature log of one batch in chronological order. `hours` bounds the window server-side.
    pub fn get_batch_logs(
        &self,
        batch_id: BatchId,
        hours: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<TemperatureLogPoint>, ClientError> {
        let mut q = Vec::new();
        if let Some(h) = hours {
            q.push(("hours", h.to_string()));
        }
        if let Some(l) = limit {
            q.push(("limit", l.to_string()));
        }
        self.get_json(&format!("/batches/{}/logs", batch_id.0), &q)
    }

    /// Raw CSV export of a batch's full log, passed through untouched.
    pub fn export_batch_csv(&self, batch_id: BatchId) -> Result<Vec<u8>, ClientError> {
        let mut res = self.get(&format!("/export/batch/{}/csv", batch_id.0), "text/csv", &[])?;
        let bytes = res.body_mut().with_config().limit(EXPORT_BODY_LIMIT).read_to_vec()?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_onto_base_url() {
        let client = FermenterClient::new("http://brewpi.local:8000/api/", None, Duration::from_secs(1));
        assert_eq!(client.url("/dashboard/"), "http://brewpi.local:8000/api/dashboard/");
        assert_eq!(client.url("batches/4/logs"), "http://brewpi.local:8000/api/batches/4/logs");
    }

    #[test]
    fn client_errors_map_onto_sync_taxonomy() {
        let http = ClientError::Http {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(SyncError::from(http), SyncError::Network("http 502: bad gateway".into()));

        let decode = DecodeError {
            context: "/dashboard/".into(),
            path: "[0].batch".into(),
            message: "missing field `batch`".into(),
        };
        assert!(matches!(
            SyncError::from(ClientError::Decode(decode)),
            SyncError::Decode(_)
        ));
    }
}
