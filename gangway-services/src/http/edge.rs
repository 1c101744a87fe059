use std::{convert::Infallible, future::Future, rc::Rc};

use gangway_core::http::HttpHandler;
use http::{Request, Response};
use hyper::body::Incoming;
use monoio::io::{AsyncReadRent, AsyncWriteRent};

use super::{bridge, ProxyBody};
use crate::common::ConnContext;

/// Serves one accepted connection with hyper over the bridge pipe.
///
/// The raw stream (plain or TLS) is pumped by a spawned task; hyper owns the
/// `Send` end so the connection can be upgraded (websockets) and the
/// upgraded halves tunneled.
pub struct EdgeConnService<H> {
    handler: Rc<H>,
    builder: hyper::server::conn::http1::Builder,
}

impl<H> EdgeConnService<H> {
    pub fn new(handler: H) -> Self {
        let mut builder = hyper::server::conn::http1::Builder::new();
        builder.keep_alive(true);
        Self {
            handler: Rc::new(handler),
            builder,
        }
    }
}

impl<H> EdgeConnService<H>
where
    H: HttpHandler<ConnContext, Incoming, Body = ProxyBody, Error = Infallible> + 'static,
{
    pub async fn serve_io<R, W>(
        &self,
        read_half: R,
        write_half: W,
        cx: ConnContext,
    ) -> Result<(), hyper::Error>
    where
        R: AsyncReadRent + 'static,
        W: AsyncWriteRent + 'static,
    {
        let (io, peer) = bridge::duplex();
        monoio::spawn(bridge::drive_halves(read_half, write_half, peer));
        let service = HyperServiceWrapper {
            cx,
            handler: self.handler.clone(),
        };
        self.builder
            .serve_connection(io, service)
            .with_upgrades()
            .await
    }
}

struct HyperServiceWrapper<CX, H> {
    cx: CX,
    handler: Rc<H>,
}

impl<CX, H> hyper::service::Service<Request<Incoming>> for HyperServiceWrapper<CX, H>
where
    H: HttpHandler<CX, Incoming, Body = ProxyBody, Error = Infallible> + 'static,
    CX: Clone + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = impl Future<Output = Result<Self::Response, Self::Error>> + 'static;

    #[inline]
    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let handler = self.handler.clone();
        let cx = self.cx.clone();
        async move { handler.handle(req, cx).await }
    }
}
