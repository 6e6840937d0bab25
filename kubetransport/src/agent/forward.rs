use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::ResourceKey;
use crate::{Error, Result};

/// The dataplane seam: opens a tunnel to one pod port and pumps an accepted
/// connection through it until either side closes. The production
/// implementation goes through the API server's port-forward endpoint; tests
/// substitute an in-memory one.
pub trait Tunnel: Clone + Send + Sync + 'static {
    fn proxy(
        &self,
        pod: &ResourceKey,
        port: u16,
        conn: TcpStream,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortPair {
    /// Service port to listen on at the local address.
    pub listen: u16,
    /// Resolved container port on the pod side.
    pub target: u16,
}

/// Everything a worker needs to serve one forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardSpec {
    pub service: ResourceKey,
    pub pod: ResourceKey,
    pub local_ip: Ipv4Addr,
    pub ports: Vec<PortPair>,
}

impl ForwardSpec {
    /// Diff identity. A changed preferred pod reads as removal plus
    /// addition, so the old tunnel is torn down before the new one starts.
    fn ident(&self) -> (&ResourceKey, &str) {
        (&self.service, &self.pod.name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Diff {
    pub added: Vec<ForwardSpec>,
    pub removed: Vec<ForwardSpec>,
}

pub fn diff(next: &[ForwardSpec], prev: &[ForwardSpec]) -> Diff {
    let next_idents: HashSet<_> = next.iter().map(ForwardSpec::ident).collect();
    let prev_idents: HashSet<_> = prev.iter().map(ForwardSpec::ident).collect();
    Diff {
        added: next
            .iter()
            .filter(|s| !prev_idents.contains(&s.ident()))
            .cloned()
            .collect(),
        removed: prev
            .iter()
            .filter(|s| !next_idents.contains(&s.ident()))
            .cloned()
            .collect(),
    }
}

/// A worker's obituary: which service it served and why it stopped.
#[derive(Debug, Clone)]
pub struct Death {
    pub service: ResourceKey,
    pub reason: String,
}

struct ActiveWorker {
    pod_name: String,
    kill: CancellationToken,
}

/// What one convergence did, for status bookkeeping and metrics.
#[derive(Debug, Default)]
pub struct Outcome {
    pub dead: Vec<Death>,
    pub started: Vec<ResourceKey>,
    pub stopped: Vec<ResourceKey>,
}

/// Owns the live workers. Mutated only from the reconciler; workers report
/// back exclusively through the unbounded `died` channel, drained at the
/// start of the next convergence.
pub struct Supervisor<T: Tunnel> {
    tunnel: T,
    active: HashMap<ResourceKey, ActiveWorker>,
    died_tx: mpsc::UnboundedSender<Death>,
    died_rx: mpsc::UnboundedReceiver<Death>,
    last_desired: Vec<ForwardSpec>,
}

impl<T: Tunnel> Supervisor<T> {
    pub fn new(tunnel: T) -> Self {
        let (died_tx, died_rx) = mpsc::unbounded_channel();
        Self {
            tunnel,
            active: HashMap::new(),
            died_tx,
            died_rx,
            last_desired: Vec::new(),
        }
    }

    /// Drives the live workers toward `desired`: tears down removed
    /// forwards, then starts added ones and resurrects workers that died
    /// while still wanted.
    pub fn converge(&mut self, desired: Vec<ForwardSpec>) -> Outcome {
        let d = diff(&desired, &self.last_desired);

        let mut dead = Vec::new();
        while let Ok(death) = self.died_rx.try_recv() {
            dead.push(death);
        }

        // A dead worker is resurrected unless its service is going away, or
        // a new worker for it is starting anyway.
        let removed_services: HashSet<&ResourceKey> = d.removed.iter().map(|s| &s.service).collect();
        let mut starting: HashSet<ResourceKey> =
            d.added.iter().map(|s| s.service.clone()).collect();
        let mut to_start = d.added.clone();
        for death in &dead {
            if removed_services.contains(&death.service) || starting.contains(&death.service) {
                continue;
            }
            match desired.iter().find(|s| s.service == death.service) {
                Some(spec) => {
                    starting.insert(spec.service.clone());
                    to_start.push(spec.clone());
                }
                // Can happen when teardown races worker death; nothing to do.
                None => warn!(service = %death.service, "death reported for unknown forward"),
            }
        }

        let mut stopped = Vec::new();
        for spec in &d.removed {
            if let Some(worker) = self.active.remove(&spec.service) {
                debug!(service = %spec.service, pod = %worker.pod_name, "stopping forward");
                worker.kill.cancel();
                stopped.push(spec.service.clone());
            }
        }

        let mut started = Vec::new();
        for spec in to_start {
            let kill = CancellationToken::new();
            let replaced = self.active.insert(
                spec.service.clone(),
                ActiveWorker {
                    pod_name: spec.pod.name.clone(),
                    kill: kill.clone(),
                },
            );
            if let Some(prev) = replaced {
                prev.kill.cancel();
            }
            info!(
                service = %spec.service,
                pod = %spec.pod,
                ip = %spec.local_ip,
                "starting forward"
            );
            started.push(spec.service.clone());
            tokio::spawn(run_worker(
                self.tunnel.clone(),
                spec,
                kill,
                self.died_tx.clone(),
            ));
        }

        self.last_desired = desired;
        Outcome {
            dead,
            started,
            stopped,
        }
    }

    pub fn is_running(&self, service: &ResourceKey) -> bool {
        self.active.contains_key(service)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Best-effort teardown of every worker, for process shutdown.
    pub fn shutdown(&mut self) {
        for (_, worker) in self.active.drain() {
            worker.kill.cancel();
        }
        self.last_desired.clear();
    }
}

/// One worker per forward. Emits at most one death per lifetime, and none
/// when the kill signal caused the exit.
async fn run_worker<T: Tunnel>(
    tunnel: T,
    spec: ForwardSpec,
    kill: CancellationToken,
    died: mpsc::UnboundedSender<Death>,
) {
    let service = spec.service.clone();
    match serve(tunnel, spec, &kill).await {
        Ok(()) => debug!(service = %service, "forward worker closed"),
        Err(e) => {
            if kill.is_cancelled() {
                return;
            }
            warn!(service = %service, error = %e, "forward worker died");
            let _ = died.send(Death {
                service,
                reason: e.to_string(),
            });
        }
    }
}

async fn serve<T: Tunnel>(tunnel: T, spec: ForwardSpec, kill: &CancellationToken) -> Result<()> {
    let mut listeners = Vec::with_capacity(spec.ports.len());
    for pp in &spec.ports {
        let addr = SocketAddr::from((spec.local_ip, pp.listen));
        let listener = TcpListener::bind(addr).await?;
        debug!(service = %spec.service, %addr, target = pp.target, "listening");
        listeners.push((listener, pp.target));
    }

    let mut accept_loops = JoinSet::new();
    for (listener, target) in listeners {
        accept_loops.spawn(accept_loop(
            tunnel.clone(),
            spec.pod.clone(),
            listener,
            target,
            kill.clone(),
        ));
    }

    // First accept failure takes the whole worker down; dropping the set
    // aborts the sibling loops and closes their listeners.
    while let Some(res) = accept_loops.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::Task(e.to_string())),
        }
    }
    Ok(())
}

async fn accept_loop<T: Tunnel>(
    tunnel: T,
    pod: ResourceKey,
    listener: TcpListener,
    target: u16,
    kill: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = kill.cancelled() => return Ok(()),
            res = listener.accept() => {
                let (conn, peer) = res?;
                debug!(%peer, pod = %pod, target, "new connection");
                let tunnel = tunnel.clone();
                let pod = pod.clone();
                // A failed dial only costs this connection, not the worker.
                tokio::spawn(async move {
                    if let Err(e) = tunnel.proxy(&pod, target, conn).await {
                        error!(pod = %pod, target, error = %e, "failed to forward connection");
                    }
                });
            }
        }
    }
}
