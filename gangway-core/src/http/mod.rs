use std::future::Future;

use http::{Request, Response};

/// Non-standard status recorded in access logs when the client abandoned the
/// request; it is never written to the wire.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// A request handler in the per-connection chain.
///
/// `CX` is the connection context (peer address, TLS marker), `B` the
/// incoming body type. Handlers own their response body type so generated
/// responses and proxied upstream bodies can flow through the same seam.
pub trait HttpHandler<CX, B> {
    type Body;
    type Error;

    fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> impl Future<Output = Result<Response<Self::Body>, Self::Error>>;
}
