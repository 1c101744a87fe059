use gangway_core::listener::AcceptedAddr;
use service_async::ParamRef;

/// Address of the connected peer.
#[derive(Debug, Clone)]
pub struct PeerAddr(pub AcceptedAddr);

/// Per-connection context handed to every request on that connection.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub peer_addr: PeerAddr,
    /// Whether the connection arrived over the TLS listener.
    pub tls: bool,
}

impl ConnContext {
    pub fn new(addr: AcceptedAddr, tls: bool) -> Self {
        Self {
            peer_addr: PeerAddr(addr),
            tls,
        }
    }
}

impl ParamRef<PeerAddr> for ConnContext {
    fn param_ref(&self) -> &PeerAddr {
        &self.peer_addr
    }
}

/// The peer ip as a string, used for `X-Forwarded-For` and as the affinity
/// key when no forwarded header is trusted.
pub fn client_ip(ctx: &ConnContext) -> Option<String> {
    ctx.peer_addr.0.ip_string()
}
