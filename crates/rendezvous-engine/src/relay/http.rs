use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{PollRequest, PollResponse, RelayClient};
use crate::error::TransportError;
use crate::model::SessionId;

/// Talks to a relay worker over HTTP:
/// `POST {base}/rooms/{room}/poll` and `DELETE {base}/rooms/{room}/sessions/{session}`.
#[derive(Clone, Debug)]
pub struct HttpRelayClient {
    client: Client,
    base_url: Url,
}

impl HttpRelayClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3).min(request_timeout))
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn room_endpoint(&self, room_id: &str, tail: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::Http("relay url cannot be a base".into()))?;
            segments.pop_if_empty();
            segments.push("rooms");
            segments.push(room_id);
            for part in tail {
                segments.push(part);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError> {
        let url = self.room_endpoint(&request.room_id, &["poll"])?;
        tracing::trace!(
            target = "rendezvous::relay",
            %url,
            cursor = ?request.cursor,
            envelopes = request.record.envelopes.len(),
            "relay poll"
        );
        let response = self.client.post(url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let payload = response
            .json::<PollResponse>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))?;
        Ok(payload)
    }

    async fn leave(&self, room_id: &str, session_id: &SessionId) -> Result<(), TransportError> {
        let url = self.room_endpoint(room_id, &["sessions", session_id.as_str()])?;
        let response = self.client.delete(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(TransportError::Status(status.as_u16())),
        }
    }
}
