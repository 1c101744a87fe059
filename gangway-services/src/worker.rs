//! Worker thread body: bind listeners, serve connections, apply commands.
use std::{net::SocketAddr, rc::Rc, sync::Arc};

use futures_channel::{
    mpsc::Receiver,
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use gangway_core::{
    listener::{AcceptedAddr, AcceptedStream, Listener, ListenerBuilder},
    orchestrator::{run_command_loop, CommandTask, RuntimeWrapper},
};
use monoio::{io::Splitable, net::ListenerOpts};
use monoio_rustls::TlsAcceptor;
use service_async::Service;
use tracing::{debug, error, info, warn};

use crate::{
    command::RouterCommand,
    common::{CatchPanicHandler, ConnContext},
    http::EdgeConnService,
    proxy::balancer::AffinityRegistry,
    router::{RouterHandler, WorkerRouter},
    tls::CertStore,
};

/// Everything a worker needs to set itself up. All `Send`: it crosses into
/// the worker thread at spawn time.
#[derive(Clone)]
pub struct WorkerConfig {
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub cert_store: Option<Arc<CertStore>>,
    pub affinity: AffinityRegistry,
}

type EdgeStack = EdgeConnService<CatchPanicHandler<RouterHandler>>;
type Accepted = (AcceptedStream, AcceptedAddr);

/// Plaintext connection service: split the stream and hand it to the edge.
struct PlainConnService {
    edge: Rc<EdgeStack>,
}

impl Service<Accepted> for PlainConnService {
    type Response = ();
    type Error = hyper::Error;

    async fn call(&self, (stream, addr): Accepted) -> Result<Self::Response, Self::Error> {
        let AcceptedStream::Tcp(stream) = stream else {
            return Ok(());
        };
        let cx = ConnContext::new(addr, false);
        let (read_half, write_half) = stream.into_split();
        self.edge.serve_io(read_half, write_half, cx).await
    }
}

/// TLS connection service: handshake first, then the same edge path with
/// the TLS marker set.
struct TlsConnService {
    acceptor: TlsAcceptor,
    edge: Rc<EdgeStack>,
}

impl Service<Accepted> for TlsConnService {
    type Response = ();
    type Error = crate::AnyError;

    async fn call(&self, (stream, addr): Accepted) -> Result<Self::Response, Self::Error> {
        let AcceptedStream::Tcp(stream) = stream else {
            return Ok(());
        };
        let cx = ConnContext::new(addr, true);
        let tls_stream = match self.acceptor.accept(stream).await {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                debug!("tls handshake failed: {e}");
                return Ok(());
            }
        };
        let (read_half, write_half) = tls_stream.into_split();
        self.edge.serve_io(read_half, write_half, cx).await?;
        Ok(())
    }
}

/// Build the closure executed on one worker thread: set up the router and
/// listeners, then run the command loop until the control plane goes away.
pub fn worker_main(
    worker_id: usize,
    config: WorkerConfig,
    shutdown: OReceiver<()>,
    commands: Receiver<CommandTask<RouterCommand>>,
) -> impl FnOnce(RuntimeWrapper) + Send + 'static {
    move |mut runtime: RuntimeWrapper| {
        runtime.block_on(async move {
            let router = WorkerRouter::new(config.affinity.clone(), config.cert_store.clone());
            let handler = CatchPanicHandler::new(RouterHandler::new(router.clone()));
            let edge: Rc<EdgeStack> = Rc::new(EdgeConnService::new(handler));

            // Receivers stay alive for the worker's lifetime; dropping them
            // on exit stops the accept loops.
            let mut listener_stops = Vec::new();

            match bind_reuseport(config.http_addr) {
                Ok(listener) => {
                    let (stop_tx, stop_rx) = ochannel();
                    listener_stops.push(stop_rx);
                    let svc = Rc::new(PlainConnService { edge: edge.clone() });
                    monoio::spawn(serve(listener, svc, stop_tx));
                    info!(worker = worker_id, addr = %config.http_addr, "http listener up");
                }
                Err(e) => {
                    error!(worker = worker_id, addr = %config.http_addr, "binding http listener failed: {e}")
                }
            }

            if let (Some(addr), Some(tls_config)) = (config.https_addr, config.tls_config.clone())
            {
                match bind_reuseport(addr) {
                    Ok(listener) => {
                        let (stop_tx, stop_rx) = ochannel();
                        listener_stops.push(stop_rx);
                        let svc = Rc::new(TlsConnService {
                            acceptor: TlsAcceptor::from(tls_config),
                            edge: edge.clone(),
                        });
                        monoio::spawn(serve(listener, svc, stop_tx));
                        info!(worker = worker_id, addr = %addr, "https listener up");
                    }
                    Err(e) => {
                        error!(worker = worker_id, addr = %addr, "binding https listener failed: {e}")
                    }
                }
            }

            let _shutdown = shutdown;
            run_command_loop(router, commands).await;
            drop(listener_stops);
            info!(worker = worker_id, "worker stopped");
        });
    }
}

fn bind_reuseport(addr: SocketAddr) -> std::io::Result<Listener> {
    // Every worker binds its own accept queue.
    let opts = ListenerOpts::default().reuse_port(true);
    ListenerBuilder::bind_tcp(addr, opts)?.build()
}

/// Accept loop: handles each connection with `svc` in its own task until
/// the stop channel's receiver is dropped.
async fn serve<Svc>(mut listener: Listener, svc: Rc<Svc>, mut stop: OSender<()>)
where
    Svc: Service<Accepted> + 'static,
    Svc::Error: std::fmt::Debug,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("listener notified to stop");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(accepted) => {
                        let svc = svc.clone();
                        monoio::spawn(async move {
                            if let Err(e) = svc.call(accepted).await {
                                debug!("connection ended with error: {e:?}");
                            }
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e:?}"),
                }
            }
        }
    }
}
