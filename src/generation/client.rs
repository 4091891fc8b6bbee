//! Generator service client
//!
//! HTTP client for the content generation service. A plain JSON body is the
//! final result. An `application/x-ndjson` body streams one object per line:
//!
//! ```text
//! {"partial": {...}}   forwarded to the caller as it arrives
//! {"result": {...}}    final result; ends the job
//! ```

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{ContentGenerator, GenerationError, GenerationRequest, ProgressSink};

/// Content type of a streamed generation body
const NDJSON: &str = "application/x-ndjson";

/// Calls `POST {base_url}/v1/generate/{kind}` for every job
pub struct HttpContentGenerator {
    client: Client,
    base_url: String,
}

/// One line of a streamed body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum StreamLine {
    Partial(Value),
    Result(Value),
}

impl HttpContentGenerator {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout_ms: u64,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, request: &GenerationRequest) -> String {
        format!("{}/v1/generate/{}", self.base_url, request.kind)
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, GenerationError> {
        let url = self.endpoint(&request);

        tracing::debug!(kind = %request.kind, room = %request.room, "Requesting generation");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            if is_ndjson(&response) {
                read_stream(response, progress).await
            } else {
                response.json().await.map_err(transport_error)
            }
        } else if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            Err(GenerationError::InvalidRequest(text))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(GenerationError::Generator {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

fn transport_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else if e.is_connect() {
        GenerationError::Unavailable
    } else {
        GenerationError::Request(e)
    }
}

fn is_ndjson(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with(NDJSON))
}

/// Forward partial lines until the result line arrives
async fn read_stream(
    response: Response,
    progress: &dyn ProgressSink,
) -> Result<Value, GenerationError> {
    let body = response.bytes_stream();
    tokio::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Some(result) = handle_line(&line, progress).await? {
                return Ok(result);
            }
        }

        match body.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk.map_err(transport_error)?),
            None => break,
        }
    }

    // Last line may lack its newline
    if let Some(result) = handle_line(&buffer, progress).await? {
        return Ok(result);
    }
    Err(GenerationError::Stream("stream ended without a result".to_string()))
}

async fn handle_line(
    line: &[u8],
    progress: &dyn ProgressSink,
) -> Result<Option<Value>, GenerationError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| GenerationError::Stream(e.to_string()))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(line).map_err(|e| GenerationError::Stream(e.to_string()))? {
        StreamLine::Partial(data) => {
            progress.partial(data).await;
            Ok(None)
        }
        StreamLine::Result(data) => Ok(Some(data)),
    }
}

/// Generator used when no generator service is configured
///
/// Every job fails with [`GenerationError::Unavailable`], so clients still get a
/// terminal error frame instead of silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl ContentGenerator for UnconfiguredGenerator {
    async fn generate(
        &self,
        _request: GenerationRequest,
        _progress: &dyn ProgressSink,
    ) -> Result<Value, GenerationError> {
        Err(GenerationError::Unavailable)
    }
}
