//! DeviceHub connection and HTTP client
//!
//! A DeviceHubClient hands WorkbenchServer the address, database and token of
//! the DeviceHub it works with; the uploader then POSTs finished snapshots
//! there.

use crate::snapshot::Document;
use reqwest::header::AUTHORIZATION;
use std::time::Duration;

/// Where and as whom to upload snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHubConnection {
    pub url: String,
    pub db: String,
    /// Value of the `Authorization` header, sent verbatim
    pub token: Option<String>,
}

impl DeviceHubConnection {
    pub fn snapshot_url(&self) -> String {
        format!(
            "{}/{}/events/devices/snapshot",
            self.url.trim_end_matches('/'),
            self.db
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceHubError {
    /// Network, DNS or timeout failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// DeviceHub answered with a non-2xx status.
    #[error("DeviceHub returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

impl DeviceHubError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeviceHubError::Request(e) => e.status().map(|s| s.as_u16()),
            DeviceHubError::HttpStatus { status, .. } => Some(*status),
        }
    }

    /// What to show the user next to a failed upload.
    pub fn response(&self) -> String {
        match self {
            DeviceHubError::Request(e) => e.to_string(),
            DeviceHubError::HttpStatus { body, .. } => body.clone(),
        }
    }
}

pub struct DeviceHubClient {
    client: reqwest::Client,
}

impl DeviceHubClient {
    pub fn new(timeout: Duration) -> Result<Self, DeviceHubError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// POST one snapshot and check the response status.
    pub async fn post_snapshot(
        &self,
        conn: &DeviceHubConnection,
        snapshot: &Document,
    ) -> Result<(), DeviceHubError> {
        let mut request = self.client.post(conn.snapshot_url()).json(snapshot);
        if let Some(token) = &conn.token {
            request = request.header(AUTHORIZATION, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceHubError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_url_tolerates_trailing_slash() {
        let conn = DeviceHubConnection {
            url: "http://dh.example/".into(),
            db: "db1".into(),
            token: None,
        };
        assert_eq!(
            conn.snapshot_url(),
            "http://dh.example/db1/events/devices/snapshot"
        );
    }

    #[test]
    fn http_status_error_carries_body() {
        let err = DeviceHubError::HttpStatus {
            status: 422,
            body: "{\"_status\": \"ERR\"}".into(),
        };
        assert_eq!(err.status(), Some(422));
        assert_eq!(err.response(), "{\"_status\": \"ERR\"}");
        assert!(err.to_string().starts_with("DeviceHub returned HTTP 422"));
    }

    #[tokio::test]
    async fn unreachable_devicehub_is_a_request_error() {
        let client = DeviceHubClient::new(Duration::from_secs(1)).unwrap();
        let conn = DeviceHubConnection {
            url: "http://127.0.0.1:9".into(),
            db: "db".into(),
            token: Some("Basic abc".into()),
        };
        let err = client
            .post_snapshot(&conn, &Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceHubError::Request(_)));
        assert_eq!(err.status(), None);
    }
}
