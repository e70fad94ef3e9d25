//! Response sinks and the capturing decorator.
//!
//! The forwarder writes an upstream response into a [`ResponseSink`]: headers
//! are mutated in place, then the head is committed, then body chunks follow.
//! [`BufferedSink`] collects everything into one response, [`StreamingSink`]
//! hands chunks to the client as they are flushed, and [`ResponseCapture`]
//! wraps either one to keep a copy for the cache.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::cache::CachedResponse;

/// The client went away before the response was fully delivered
#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// The upstream body ended abnormally after the head was sent
#[derive(Debug, Error)]
#[error("upstream response aborted")]
pub struct BodyAborted;

/// Destination for a response head and body
#[async_trait]
pub trait ResponseSink: Send {
    fn headers(&self) -> &HeaderMap;

    /// Live header map. Changes are visible to the client until the head is written.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commit the status and current headers. Later calls are ignored.
    fn write_head(&mut self, status: StatusCode);

    /// Append body bytes, committing a 200 head first if none was written.
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;

    /// Push any buffered body bytes to the client.
    async fn flush(&mut self) -> Result<(), SinkClosed> {
        Ok(())
    }

    /// Terminate the body with an error so the client does not mistake it for a complete one.
    async fn abort(&mut self) {}

    /// Status committed so far, if any.
    fn status(&self) -> Option<StatusCode>;

    fn bytes_written(&self) -> u64;

    fn head_written(&self) -> bool {
        self.status().is_some()
    }
}

/// Collects the whole response in memory
#[derive(Debug, Default)]
pub struct BufferedSink {
    headers: HeaderMap,
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_response(self) -> Response {
        let (status, headers) = self.head.unwrap_or((StatusCode::OK, self.headers));

        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.head.is_none() {
            self.head = Some((status, self.headers.clone()));
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if self.head.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(status, _)| *status)
    }

    fn bytes_written(&self) -> u64 {
        self.body.len() as u64
    }
}

type HeadSender = oneshot::Sender<(StatusCode, HeaderMap)>;
type BodyFrame = Result<Bytes, BodyAborted>;

/// Streams the body to the client through a bounded channel
pub struct StreamingSink {
    headers: HeaderMap,
    status: Option<StatusCode>,
    head_tx: Option<HeadSender>,
    body_tx: mpsc::Sender<BodyFrame>,
    pending: BytesMut,
    flush_each_write: bool,
    bytes_written: u64,
}

/// Client side of a [`StreamingSink`]
pub struct PendingResponse {
    head_rx: oneshot::Receiver<(StatusCode, HeaderMap)>,
    body_rx: mpsc::Receiver<BodyFrame>,
}

impl StreamingSink {
    /// Create a connected sink/response pair. With `flush_each_write` every
    /// write goes straight to the client, otherwise writes accumulate until
    /// [`ResponseSink::flush`].
    pub fn channel(flush_each_write: bool) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);

        let sink = Self {
            headers: HeaderMap::new(),
            status: None,
            head_tx: Some(head_tx),
            body_tx,
            pending: BytesMut::new(),
            flush_each_write,
            bytes_written: 0,
        };

        (sink, PendingResponse { head_rx, body_rx })
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.body_tx.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl ResponseSink for StreamingSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);

        if let Some(head_tx) = self.head_tx.take() {
            // Receiver gone means the client already left; body writes will report it
            let _ = head_tx.send((status, self.headers.clone()));
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if self.status.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.bytes_written += chunk.len() as u64;

        if self.flush_each_write {
            self.send(chunk).await
        } else {
            self.pending.extend_from_slice(&chunk);
            Ok(())
        }
    }

    async fn flush(&mut self) -> Result<(), SinkClosed> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.send(chunk).await
    }

    async fn abort(&mut self) {
        let _ = self.body_tx.send(Err(BodyAborted)).await;
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl PendingResponse {
    /// Wait for the head and build a response whose body follows the sink.
    /// Returns `None` if the sink was dropped without writing a head.
    pub async fn into_response(self) -> Option<Response> {
        let (status, headers) = self.head_rx.await.ok()?;

        let body = futures::stream::unfold(self.body_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Some(response)
    }
}

/// Sink decorator that mirrors every write to the wrapped sink and keeps a copy.
///
/// Header mutations go straight to the wrapped sink. The header snapshot is
/// taken when the head is committed, explicitly or by the first body write,
/// so it matches what the client received.
pub struct ResponseCapture<S> {
    inner: S,
    snapshot: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl<S: ResponseSink> ResponseCapture<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            snapshot: None,
            body: BytesMut::new(),
        }
    }

    pub fn captured_status(&self) -> Option<StatusCode> {
        self.snapshot.as_ref().map(|(status, _)| *status)
    }

    /// Split into the captured copy (if a head was written) and the wrapped sink.
    pub fn finish(self) -> (Option<CachedResponse>, S) {
        let captured = self.snapshot.map(|(status, headers)| CachedResponse {
            status,
            headers,
            body: self.body.freeze(),
        });
        (captured, self.inner)
    }
}

#[async_trait]
impl<S: ResponseSink> ResponseSink for ResponseCapture<S> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.snapshot.is_none() {
            self.snapshot = Some((status, self.inner.headers().clone()));
        }
        self.inner.write_head(status);
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if self.snapshot.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.body.extend_from_slice(&chunk);
        self.inner.write(chunk).await
    }

    async fn flush(&mut self) -> Result<(), SinkClosed> {
        self.inner.flush().await
    }

    async fn abort(&mut self) {
        self.inner.abort().await
    }

    fn status(&self) -> Option<StatusCode> {
        self.inner.status()
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }
}

/// Write a complete plain-text response into a sink.
pub async fn write_text<S: ResponseSink + ?Sized>(
    sink: &mut S,
    status: StatusCode,
    body: &'static str,
) -> Result<(), SinkClosed> {
    sink.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    sink.write_head(status);
    sink.write(Bytes::from_static(body.as_bytes())).await?;
    sink.flush().await
}
