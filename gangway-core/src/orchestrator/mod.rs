//! Worker fleet orchestration for the thread-per-core traffic plane.
//!
//! Every worker thread runs its own io driver and a full copy of the routing
//! state. Admin operations never touch that state directly: they are turned
//! into commands, broadcast to all workers over channels, and the per-worker
//! results are folded into a [`ResultGroup`]. Deployments use this in two
//! stages — a *stage* command that builds and health-gates the new upstream
//! set, then a *commit* (or *abort*) command — so a new load balancer is
//! fully ready before the old one starts draining anywhere.
use std::{rc::Rc, thread::JoinHandle};

use futures_channel::{
    mpsc::{channel, Receiver, Sender},
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use futures_util::{stream::StreamExt, SinkExt};
use tracing::{error, warn};

use crate::{config::RuntimeConfig, AnyError};

mod runtime;
pub use runtime::RuntimeWrapper;

/// A collection of per-worker results for one dispatched command.
pub struct ResultGroup<T, E>(Vec<Result<T, E>>);

impl<T, E> From<Vec<Result<T, E>>> for ResultGroup<T, E> {
    fn from(value: Vec<Result<T, E>>) -> Self {
        Self(value)
    }
}

impl<T, E> From<ResultGroup<T, E>> for Vec<Result<T, E>> {
    fn from(value: ResultGroup<T, E>) -> Self {
        value.0
    }
}

impl<E> ResultGroup<(), E> {
    /// Ok iff every worker succeeded; otherwise the first failure.
    pub fn err(self) -> Result<(), E> {
        for r in self.0.into_iter() {
            r?;
        }
        Ok(())
    }
}

/// A command executable against per-worker state `S`.
pub trait Execute<S> {
    type Error: Into<AnyError>;
    fn execute(self, state: &S) -> impl std::future::Future<Output = Result<(), Self::Error>>;
}

/// A command paired with the channel its execution result travels back on.
pub struct CommandTask<C> {
    cmd: C,
    result: OSender<Result<(), AnyError>>,
}

impl<C> CommandTask<C> {
    pub fn new(cmd: C) -> (Self, OReceiver<Result<(), AnyError>>) {
        let (tx, rx) = ochannel();
        (Self { cmd, result: tx }, rx)
    }
}

/// Spawns worker threads and broadcasts commands to them.
///
/// The fleet itself lives on the control thread. Dispatch clones the
/// per-worker senders, so concurrent admin operations may be in flight at
/// once; ordering between dependent commands (stage before commit) is
/// enforced by the caller awaiting each phase.
pub struct WorkerFleet<C> {
    runtime_config: RuntimeConfig,
    workers: Vec<Sender<CommandTask<C>>>,
}

impl<C> WorkerFleet<C> {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }
}

impl<C: Send + 'static> WorkerFleet<C> {
    /// Start workers according to the runtime config.
    ///
    /// `f` builds, per worker, the closure executed on the worker thread; it
    /// receives the worker id, a shutdown receiver and the command channel.
    /// Thread join handles and shutdown senders are returned to the caller.
    pub fn spawn_workers<FN, SO>(&mut self, f: FN) -> Vec<(JoinHandle<()>, OSender<()>)>
    where
        FN: Fn(usize, OReceiver<()>, Receiver<CommandTask<C>>) -> SO,
        SO: FnOnce(RuntimeWrapper) + Send + 'static,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        (0..self.runtime_config.worker_threads)
            .map(|worker_id| {
                let (tx, rx) = channel(128);
                let (finish_tx, finish_rx) = ochannel::<()>();
                let body = f(worker_id, finish_rx, rx);
                let runtime_config = self.runtime_config.clone();
                let handler = std::thread::Builder::new()
                    .name(format!("gangway-worker-{worker_id}"))
                    .spawn(move || {
                        // bind thread to cpu core
                        if let Some(cores) = cores {
                            let core = worker_id % cores;
                            if let Err(e) = monoio::utils::bind_to_cpu_set([core]) {
                                warn!("bind thread {worker_id} to core {core} failed: {e}");
                            }
                        }
                        body(RuntimeWrapper::from(&runtime_config))
                    })
                    .expect("start worker thread failed");
                self.workers.push(tx);
                (handler, finish_tx)
            })
            .collect()
    }

    /// Broadcast `cmd` to every worker and collect their results. All
    /// workers receive the command before any result is awaited, so long
    /// commands (health gates, drains) run fleet-wide in parallel.
    pub async fn dispatch(&self, cmd: C) -> ResultGroup<(), AnyError>
    where
        C: Clone,
    {
        let mut pending = Vec::with_capacity(self.workers.len());
        for sender in self.workers.iter() {
            let (task, rx) = CommandTask::new(cmd.clone());
            let mut sender = sender.clone();
            match sender.send(task).await {
                Ok(_) => pending.push(Ok(rx)),
                Err(e) => pending.push(Err(AnyError::from(e))),
            }
        }
        let mut results = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Ok(rx) => match rx.await {
                    Ok(r) => results.push(r),
                    Err(e) => results.push(Err(e.into())),
                },
                Err(e) => results.push(Err(e)),
            }
        }
        results.into()
    }
}

/// Per-worker command loop.
///
/// Each command runs in its own task so a long stage (health gate) does not
/// stall unrelated commands; phase ordering for one deployment is already
/// serialized by the control plane awaiting each dispatch.
pub async fn run_command_loop<C, S>(state: Rc<S>, mut rx: Receiver<CommandTask<C>>)
where
    C: Execute<S> + 'static,
    S: 'static,
{
    while let Some(task) = rx.next().await {
        let state = state.clone();
        monoio::spawn(async move {
            let res = task.cmd.execute(&state).await.map_err(Into::into);
            if task.result.send(res).is_err() {
                error!("unable to send back command result");
            }
        });
    }
}

