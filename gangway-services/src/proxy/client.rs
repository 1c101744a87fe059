use std::{cell::RefCell, io};

use http::{Request, Response, StatusCode};
use hyper::{body::Incoming, client::conn::http1};
use monoio::{io::Splitable, net::TcpStream};
use tracing::debug;

use crate::http::{bridge, ProxyBody};

/// Idle upstream connections kept per target.
const MAX_POOLED_CONNECTIONS: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),
    #[error("upstream protocol error: {0}")]
    Protocol(#[from] hyper::Error),
}

/// Open a fresh http/1.1 connection to `addr` and spawn its driver task.
/// Upgrades are enabled so a 101 response can be tunneled.
pub async fn connect_http1(addr: &str) -> Result<http1::SendRequest<ProxyBody>, UpstreamError> {
    let stream = TcpStream::connect(addr).await?;
    let (io, peer) = bridge::duplex();
    let (read_half, write_half) = stream.into_split();
    monoio::spawn(bridge::drive_halves(read_half, write_half, peer));
    let (sender, conn) = http1::handshake(io).await?;
    monoio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("upstream connection ended: {e}");
        }
    });
    Ok(sender)
}

/// Plain-http client for one upstream endpoint with a small idle pool.
///
/// Connections are checked back in only after a reusable exchange; an
/// upgraded (101) connection belongs to its tunnel and is never pooled.
pub struct UpstreamClient {
    addr: String,
    pool: RefCell<Vec<http1::SendRequest<ProxyBody>>>,
}

impl UpstreamClient {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            pool: RefCell::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, UpstreamError> {
        let mut sender = loop {
            let pooled = self.pool.borrow_mut().pop();
            match pooled {
                Some(mut sender) => {
                    // A pooled connection may have died idle; skip it while
                    // the request is still unconsumed.
                    if sender.ready().await.is_ok() && !sender.is_closed() {
                        break sender;
                    }
                }
                None => break connect_http1(&self.addr).await?,
            }
        };

        let response = sender.send_request(req).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS && !sender.is_closed() {
            let mut pool = self.pool.borrow_mut();
            if pool.len() < MAX_POOLED_CONNECTIONS {
                pool.push(sender);
            }
        }
        Ok(response)
    }
}
