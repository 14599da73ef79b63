//! HTTP implementation of the chunk transport.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::{ChunkPayload, ChunkTransport, RemoteChunk, RemoteFile, TransportError};

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileBody {
    id: String,
}

/// Uploads chunks to `{base_url}/upload/session/{id}/chunk` and finalizes
/// with `{base_url}/upload/session/{id}/finish`. Session refresh and
/// authentication token lifecycle belong to the host; the transport only
/// attaches the bearer token it was given.
pub struct HttpChunkTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpChunkTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn classify(response: Response) -> TransportError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if retryable(status) {
            TransportError::Network(format!("{status} - {text}"))
        } else {
            TransportError::Fatal {
                status: status.as_u16(),
                message: text,
            }
        }
    }
}

/// Server-side trouble and throttling are worth retrying; other client
/// errors mean the session or the account is in a state retries cannot fix.
fn retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn send_chunk(&self, payload: ChunkPayload) -> Result<RemoteChunk, TransportError> {
        let url = format!("{}/upload/session/{}/chunk", self.base_url, payload.session_id);
        let chunk_size = payload.bytes.len();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[
                // The remote API numbers chunks from 1.
                ("chunk_number", (payload.chunk_index + 1).to_string()),
                ("chunk_size", chunk_size.to_string()),
                ("chunk_hash", payload.chunk_hash.clone()),
                ("total_chunks", payload.total_chunks.to_string()),
            ])
            .header("Content-Type", "application/octet-stream")
            .body(payload.bytes)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        let envelope: ApiEnvelope<ChunkBody> = response
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("malformed chunk response: {e}")))?;
        Ok(RemoteChunk {
            remote_id: envelope.data.id,
        })
    }

    async fn finalize(
        &self,
        session_id: &str,
        total_chunks: u64,
    ) -> Result<RemoteFile, TransportError> {
        let url = format!("{}/upload/session/{}/finish", self.base_url, session_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "total_chunks": total_chunks }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        let envelope: ApiEnvelope<FileBody> = response
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("malformed finish response: {e}")))?;
        Ok(RemoteFile {
            remote_id: envelope.data.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(session_id: &str) -> ChunkPayload {
        ChunkPayload {
            session_id: session_id.to_string(),
            chunk_index: 0,
            total_chunks: 2,
            chunk_hash: "deadbeef".to_string(),
            bytes: b"hello".to_vec(),
        }
    }

    #[tokio::test]
    async fn send_chunk_posts_wire_numbering_and_parses_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/session/s1/chunk"))
            .and(query_param("chunk_number", "1"))
            .and(query_param("chunk_size", "5"))
            .and(query_param("chunk_hash", "deadbeef"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "id": "chunk-42" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpChunkTransport::new(server.uri(), "token").unwrap();
        let remote = transport.send_chunk(payload("s1")).await.unwrap();
        assert_eq!(remote.remote_id, "chunk-42");
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpChunkTransport::new(server.uri(), "token").unwrap();
        assert!(matches!(
            transport.send_chunk(payload("s1")).await,
            Err(TransportError::Network(_))
        ));
    }

    #[tokio::test]
    async fn quota_rejection_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let transport = HttpChunkTransport::new(server.uri(), "token").unwrap();
        match transport.send_chunk(payload("s1")).await {
            Err(TransportError::Fatal { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalize_returns_the_remote_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/session/s1/finish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "id": "file-7" }
            })))
            .mount(&server)
            .await;

        let transport = HttpChunkTransport::new(server.uri(), "token").unwrap();
        let file = transport.finalize("s1", 2).await.unwrap();
        assert_eq!(file.remote_id, "file-7");
    }
}
