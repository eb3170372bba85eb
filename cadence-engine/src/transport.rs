//! The server side of reconciliation, behind a trait so tests can run the
//! whole engine against an in-process fake.

use cadence_core::wire::{CalendarSnapshot, SyncRequest, SyncResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a non-success status.
    #[error("server rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// The server answered 2xx but the body did not parse.
    #[error("malformed server response: {0}")]
    Malformed(String),
}

#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    async fn push_batch(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, TransportError>;

    /// `month` formatted `YYYY-MM`.
    async fn fetch_calendar(
        &self,
        access_token: &str,
        month: &str,
    ) -> Result<CalendarSnapshot, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| TransportError::Malformed(format!("{e} in {body:?}")))
    }
}

impl SyncTransport for HttpTransport {
    async fn push_batch(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        let response = self
            .client
            .post(format!("{}/sync", self.base_url))
            .bearer_auth(access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn fetch_calendar(
        &self,
        access_token: &str,
        month: &str,
    ) -> Result<CalendarSnapshot, TransportError> {
        let response = self
            .client
            .get(format!("{}/calendar", self.base_url))
            .query(&[("month", month)])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        let transport = HttpTransport::new("https://api.example.com/");
        assert_eq!(transport.base_url, "https://api.example.com");
        let transport = HttpTransport::new("https://api.example.com");
        assert_eq!(transport.base_url, "https://api.example.com");
    }
}
