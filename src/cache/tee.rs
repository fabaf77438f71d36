//! Request body capture while the body streams upstream.

use std::sync::{Arc, Mutex};

use axum::body::{Body, HttpBody};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;

use super::lock::mutex_lock;

/// Shared buffer that collects a copy of every chunk passing through a wrapped body.
#[derive(Clone, Default)]
pub struct BodyCapture {
    buffer: Arc<Mutex<BytesMut>>,
}

impl BodyCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `body` so each data frame is copied into this capture as it is polled.
    ///
    /// Bodies known to be empty are returned as-is so their size hint survives.
    pub fn tee(&self, body: Body) -> Body {
        if body.size_hint().exact() == Some(0) {
            return body;
        }
        let capture = self.clone();
        Body::from_stream(
            body.into_data_stream()
                .inspect_ok(move |chunk| capture.record(chunk)),
        )
    }

    fn record(&self, chunk: &Bytes) {
        mutex_lock(&self.buffer, "cache::tee", "record").extend_from_slice(chunk);
    }

    /// Bytes observed so far. The buffer is left empty.
    pub fn take(&self) -> Bytes {
        mutex_lock(&self.buffer, "cache::tee", "take")
            .split()
            .freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tee_forwards_and_records_every_chunk() {
        let capture = BodyCapture::new();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let body = capture.tee(Body::from_stream(futures::stream::iter(chunks)));

        let forwarded = axum::body::to_bytes(body, usize::MAX)
            .await
            .expect("collect body");

        assert_eq!(forwarded, Bytes::from_static(b"hello world"));
        assert_eq!(capture.take(), Bytes::from_static(b"hello world"));
        assert!(capture.take().is_empty());
    }

    #[tokio::test]
    async fn unpolled_body_records_nothing() {
        let capture = BodyCapture::new();
        let _body = capture.tee(Body::from("ignored"));
        assert!(capture.take().is_empty());
    }

    #[test]
    fn empty_body_keeps_exact_size_hint() {
        let capture = BodyCapture::new();
        let body = capture.tee(Body::empty());
        assert_eq!(body.size_hint().exact(), Some(0));
    }
}
