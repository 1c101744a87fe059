use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use gangway_core::http::HttpHandler;
use http::{Request, Response, StatusCode};
use tracing::error;

use crate::http::{generate_response, ProxyBody};

/// Converts a panic in the wrapped handler into a 500 for that request, so
/// one misbehaving request cannot take the connection task (and every other
/// request queued on it) down with it.
pub struct CatchPanicHandler<H> {
    inner: H,
}

impl<H> CatchPanicHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<CX, B, H> HttpHandler<CX, B> for CatchPanicHandler<H>
where
    H: HttpHandler<CX, B, Body = ProxyBody, Error = std::convert::Infallible>,
{
    type Body = ProxyBody;
    type Error = std::convert::Infallible;

    async fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> Result<Response<Self::Body>, Self::Error> {
        match AssertUnwindSafe(self.inner.handle(request, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                error!("request handler panicked: {panic:?}");
                Ok(generate_response(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }
}
