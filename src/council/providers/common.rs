//! Shared utilities used across provider adapter implementations.

use std::time::Duration;

use lazy_static::lazy_static;

use crate::council::provider::{ChunkStream, Completion, StreamChunk};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm,
    /// which matters when a council fans out many concurrent requests to the
    /// same upstream host. Per-request timeouts override the coarse default
    /// configured here.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Promote a whole-response completion into the streaming chunk protocol:
/// one `Chunk` carrying the full content, then `Done` echoing it.
///
/// Gateways without upstream streaming support use this so that downstream
/// consumers see a single uniform protocol.
pub fn promote_completion(result: Option<Completion>, model: &str) -> ChunkStream {
    let chunks = match result {
        Some(completion) => {
            let content = completion.content;
            vec![
                StreamChunk::Chunk {
                    content: content.clone(),
                },
                StreamChunk::Done {
                    response: Some(content),
                },
            ]
        }
        None => vec![StreamChunk::Error {
            message: format!("model {} returned no response", model),
        }],
    };
    Box::pin(futures_util::stream::iter(chunks))
}

/// Single-element error stream, for failures detected before any bytes flow.
pub fn error_stream(message: impl Into<String>) -> ChunkStream {
    Box::pin(futures_util::stream::iter(vec![StreamChunk::Error {
        message: message.into(),
    }]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_promote_completion_yields_chunk_then_done() {
        let mut stream = promote_completion(Some(Completion::new("full answer")), "m1");
        assert_eq!(
            stream.next().await,
            Some(StreamChunk::Chunk {
                content: "full answer".into()
            })
        );
        assert_eq!(
            stream.next().await,
            Some(StreamChunk::Done {
                response: Some("full answer".into())
            })
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_promote_missing_completion_yields_error() {
        let mut stream = promote_completion(None, "m1");
        match stream.next().await {
            Some(StreamChunk::Error { message }) => assert!(message.contains("m1")),
            other => panic!("expected error chunk, got {:?}", other),
        }
        assert_eq!(stream.next().await, None);
    }
}
