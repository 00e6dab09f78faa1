//! HTTP transport using reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response, Url};
use tracing::debug;
use uuid::Uuid;

use super::{CreateRequest, CreatedSession, TransportError, UploadTransport};
use crate::core::security::SecurityHeaders;
use crate::domain::CompletionResult;
use crate::protocol::{
    encode_metadata, parse_expires, CHUNK_CONTENT_TYPE, HEADER_RESUMABLE, HEADER_UPLOAD_EXPIRES,
    HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET, PROTOCOL_VERSION,
};

/// reqwest-backed [`UploadTransport`]
pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn signed(builder: RequestBuilder, headers: &SecurityHeaders) -> RequestBuilder {
    headers
        .pairs()
        .into_iter()
        .fold(builder, |b, (name, value)| b.header(name, value))
        .header(HEADER_RESUMABLE, PROTOCOL_VERSION)
}

async fn send(builder: RequestBuilder, timeout: Duration) -> Result<Response, TransportError> {
    builder.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            TransportError::Timeout(timeout)
        } else {
            TransportError::Network(e.to_string())
        }
    })
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

async fn error_for(response: Response) -> TransportError {
    let status = response.status().as_u16();
    let server_offset = header_u64(&response, HEADER_UPLOAD_OFFSET);
    let message = response.text().await.unwrap_or_default();

    match TransportError::from_status(status, message) {
        TransportError::OffsetMismatch { .. } => TransportError::OffsetMismatch { server_offset },
        other => other,
    }
}

fn required_offset(response: &Response) -> Result<u64, TransportError> {
    header_u64(response, HEADER_UPLOAD_OFFSET)
        .ok_or_else(|| TransportError::Protocol("response lacks Upload-Offset".to_string()))
}

#[async_trait]
impl UploadTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, request: CreateRequest) -> Result<CreatedSession, TransportError> {
        let builder = self
            .client
            .post(&request.endpoint)
            .header(HEADER_UPLOAD_LENGTH, request.upload_length.to_string())
            .header(HEADER_UPLOAD_METADATA, encode_metadata(&request.metadata));
        let response = send(signed(builder, &request.headers), request.timeout).await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let raw_location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransportError::Protocol("create response lacks Location".to_string()))?;

        // Location may be relative to the endpoint
        let location = Url::parse(&request.endpoint)
            .and_then(|base| base.join(raw_location))
            .map(|url| url.to_string())
            .map_err(|e| TransportError::Protocol(format!("bad Location '{}': {}", raw_location, e)))?;

        let expires_at = response
            .headers()
            .get(HEADER_UPLOAD_EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_expires);

        debug!(%location, "Upload session created");
        Ok(CreatedSession {
            location,
            expires_at,
        })
    }

    async fn head_offset(
        &self,
        location: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        let builder = self.client.head(location).header(CACHE_CONTROL, "no-store");
        let response = send(signed(builder, headers), timeout).await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        required_offset(&response)
    }

    async fn patch(
        &self,
        location: &str,
        offset: u64,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        let builder = self
            .client
            .patch(location)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .header(CONTENT_TYPE, CHUNK_CONTENT_TYPE)
            .body(body);
        let response = send(signed(builder, headers), timeout).await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        required_offset(&response)
    }

    async fn complete(
        &self,
        webhook: &str,
        body: Vec<u8>,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<CompletionResult, TransportError> {
        let builder = self
            .client
            .post(webhook)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = send(signed(builder, headers), timeout).await?;
        let status = response.status().as_u16();

        if status == 409 {
            // Some servers answer a duplicate with 409 and the prior result
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<CompletionResult>(&text) {
                Ok(prior) => Ok(prior),
                Err(_) => Err(TransportError::AlreadyFinalized),
            };
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        response
            .json::<CompletionResult>()
            .await
            .map_err(|e| TransportError::Protocol(format!("bad completion response: {}", e)))
    }

    async fn probe(
        &self,
        url: &str,
        headers: &SecurityHeaders,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let cache_buster = Uuid::new_v4().simple().to_string();
        let builder = self
            .client
            .get(url)
            .query(&[("cb", cache_buster.as_str())])
            .header(CACHE_CONTROL, "no-store");
        let response = send(signed(builder, headers), timeout).await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        Ok(bytes.len())
    }
}
