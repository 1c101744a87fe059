use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};

use crate::{common::Signal, proxy::buffer::SpooledBody, proxy::target::RequestGuard};

#[derive(thiserror::Error, Debug)]
pub enum BodyError {
    #[error("body stream error: {0}")]
    Stream(#[from] hyper::Error),
    #[error("body size limit exceeded")]
    LimitExceeded,
    #[error("request cancelled")]
    Cancelled,
    #[error("buffer io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::convert::Infallible> for BodyError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

enum BodyKind {
    Empty,
    Bytes(Option<Bytes>),
    Incoming(Incoming),
    Spooled(SpooledBody),
}

/// The one body type at the proxy seam, in both directions.
///
/// Carries three optional riders:
/// - a byte `limit`, erroring the stream when exceeded;
/// - a cancellation [`Signal`] (drain), aborting the stream at its next poll;
/// - the [`RequestGuard`] of the inflight entry, released when the stream
///   finishes, errors or is dropped — a request counts as inflight until its
///   response body has fully left the building, not just until its headers
///   have.
pub struct ProxyBody {
    kind: BodyKind,
    limit: Option<u64>,
    cancel: Option<Signal>,
    guard: Option<RequestGuard>,
}

impl ProxyBody {
    fn new(kind: BodyKind) -> Self {
        Self {
            kind,
            limit: None,
            cancel: None,
            guard: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(BodyKind::Empty)
    }

    pub fn from_bytes(data: Bytes) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        Self::new(BodyKind::Bytes(Some(data)))
    }

    pub fn incoming(body: Incoming) -> Self {
        Self::new(BodyKind::Incoming(body))
    }

    pub fn spooled(body: SpooledBody) -> Self {
        Self::new(BodyKind::Spooled(body))
    }

    /// Cap the stream at `limit` bytes; 0 means unlimited.
    pub fn with_limit(mut self, limit: u64) -> Self {
        if limit > 0 {
            self.limit = Some(limit);
        }
        self
    }

    pub fn with_cancel(mut self, cancel: Signal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_guard(mut self, guard: RequestGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(cancel) = &this.cancel {
            if cancel.fired() {
                this.guard.take();
                return Poll::Ready(Some(Err(BodyError::Cancelled)));
            }
        }
        let frame = match &mut this.kind {
            BodyKind::Empty => None,
            BodyKind::Bytes(data) => data.take().map(|data| Ok(Frame::data(data))),
            BodyKind::Incoming(inner) => match ready!(Pin::new(inner).poll_frame(cx)) {
                Some(result) => Some(result.map_err(BodyError::from)),
                None => None,
            },
            BodyKind::Spooled(inner) => ready!(inner.poll_frame_inner(cx)),
        };
        match frame {
            Some(Ok(frame)) => {
                if let (Some(data), Some(remaining)) = (frame.data_ref(), this.limit.as_mut()) {
                    let len = data.len() as u64;
                    if len > *remaining {
                        this.guard.take();
                        return Poll::Ready(Some(Err(BodyError::LimitExceeded)));
                    }
                    *remaining -= len;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.guard.take();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.guard.take();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Bytes(data) => data.is_none(),
            BodyKind::Incoming(inner) => inner.is_end_stream(),
            BodyKind::Spooled(inner) => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Empty => SizeHint::with_exact(0),
            BodyKind::Bytes(data) => {
                SizeHint::with_exact(data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
            }
            BodyKind::Incoming(inner) => inner.size_hint(),
            BodyKind::Spooled(inner) => SizeHint::with_exact(inner.remaining()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[monoio::test]
    async fn limit_fails_oversized_stream() {
        let mut body = ProxyBody::from_bytes(Bytes::from_static(b"0123456789")).with_limit(4);
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(matches!(err, BodyError::LimitExceeded));
    }

    #[monoio::test]
    async fn limit_passes_exact_size() {
        let mut body = ProxyBody::from_bytes(Bytes::from_static(b"0123")).with_limit(4);
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"0123"));
        assert!(body.frame().await.is_none());
    }

    #[monoio::test]
    async fn cancelled_body_errors() {
        let cancel = Signal::new();
        let mut body =
            ProxyBody::from_bytes(Bytes::from_static(b"data")).with_cancel(cancel.clone());
        cancel.fire();
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(matches!(err, BodyError::Cancelled));
    }

    #[monoio::test]
    async fn empty_body_ends_immediately() {
        let mut body = ProxyBody::empty();
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }
}
