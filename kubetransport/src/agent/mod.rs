pub mod alloc;
pub mod associate;
pub mod forward;
pub mod hosts;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod as KubePod, Service as KubeService};
use kube::api::Api;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::config::Args;
use crate::kubernetes::{self, ApiTunnel, ClusterSnapshot, StoreSnapshot, events};
use crate::metrics::Metrics;
use crate::state::{Forward, ResourceKey, Status, resolve_target_port};
use self::alloc::Allocator;
use self::forward::{ForwardSpec, PortPair, Supervisor, Tunnel};
use self::store::Store;

/// Composition root: owns every component and drives the reconcile pipeline
/// over debounced ticks. All state mutation happens here, sequentially.
pub struct Agent<S: ClusterSnapshot, T: Tunnel> {
    snapshot: S,
    allocator: Allocator,
    store: Store,
    hosts_path: PathBuf,
    supervisor: Supervisor<T>,
    last_errors: HashMap<ResourceKey, String>,
    forwards_tx: watch::Sender<Vec<Forward>>,
    metrics: Metrics,
}

impl<S: ClusterSnapshot, T: Tunnel> Agent<S, T> {
    pub fn new(
        snapshot: S,
        allocator: Allocator,
        store: Store,
        hosts_path: PathBuf,
        supervisor: Supervisor<T>,
        metrics: Metrics,
        forwards_tx: watch::Sender<Vec<Forward>>,
    ) -> Self {
        Self {
            snapshot,
            allocator,
            store,
            hosts_path,
            supervisor,
            last_errors: HashMap::new(),
            forwards_tx,
            metrics,
        }
    }

    /// One pass: snapshot -> associate -> allocate -> hosts -> converge.
    /// Any failure abandons the rest of the tick; the next tick starts from
    /// scratch against fresh cluster state.
    pub fn reconcile(&mut self) -> Result<()> {
        let services = self.snapshot.services()?;
        let pods = self.snapshot.pods()?;
        let associations = associate::associate(services, &pods);

        let manageable: Vec<ResourceKey> = associations
            .iter()
            .filter(|a| a.service.manageable())
            .map(|a| a.service.key.clone())
            .collect();
        let ips = self.allocator.ensure_allocated(&self.store, &manageable)?;

        let mut forwards: Vec<Forward> = associations
            .into_iter()
            .map(|assoc| {
                let status = assoc.phase();
                let pod = assoc.preferred_pod().cloned();
                let local_ip = ips.get(&assoc.service.key).copied();
                let last_error = self.last_errors.get(&assoc.service.key).cloned();
                Forward {
                    service: assoc.service,
                    pod,
                    local_ip,
                    status,
                    last_error,
                }
            })
            .collect();
        forwards.sort_by_key(Forward::sort_key);

        hosts::sync(&self.hosts_path, &forwards)?;

        let desired: Vec<ForwardSpec> = forwards
            .iter()
            .filter_map(|f| {
                let pod = f.pod.as_ref()?;
                let ip = f.local_ip?;
                let ports = f
                    .service
                    .ports
                    .iter()
                    .map(|sp| PortPair {
                        listen: sp.port,
                        target: resolve_target_port(sp, pod),
                    })
                    .collect();
                Some(ForwardSpec {
                    service: f.service.key.clone(),
                    pod: pod.key.clone(),
                    local_ip: ip,
                    ports,
                })
            })
            .collect();

        let outcome = self.supervisor.converge(desired);
        for death in &outcome.dead {
            self.metrics.worker_deaths.inc();
            self.last_errors
                .insert(death.service.clone(), death.reason.clone());
        }

        // A forward whose worker is live is active; one whose worker just
        // died drops back to setup and carries the error until it recovers.
        let dead_now: HashSet<ResourceKey> =
            outcome.dead.iter().map(|d| d.service.clone()).collect();
        for f in &mut forwards {
            if f.status != Status::Setup {
                continue;
            }
            if dead_now.contains(&f.service.key) {
                f.last_error = self.last_errors.get(&f.service.key).cloned();
            } else if self.supervisor.is_running(&f.service.key) {
                f.status = Status::Active;
                self.last_errors.remove(&f.service.key);
                f.last_error = None;
            }
        }

        self.metrics
            .active_forwards
            .set(self.supervisor.active_count() as i64);
        self.forwards_tx.send_replace(forwards);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.supervisor.shutdown();
    }
}

/// Long-running entry point: wires the kube client, watches, debouncer and
/// reconcile loop together and runs until cancelled.
pub async fn start(
    args: Args,
    metrics: Metrics,
    forwards_tx: watch::Sender<Vec<Forward>>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = kubernetes::client(args.kubeconfig.as_deref()).await?;
    let store = Store::open(&args.state_db)?;
    // An unreadable hosts file is a startup failure, not something to
    // discover on the first tick.
    hosts::load(&args.hosts_file)?;

    let (change_tx, change_rx) = mpsc::channel(1024);
    let (tick_tx, mut tick_rx) = mpsc::channel(1);
    tokio::spawn(events::debounce(
        change_rx,
        tick_tx,
        Duration::from_secs(args.debounce),
        cancel.child_token(),
    ));

    let services = kubernetes::watch(
        Api::<KubeService>::all(client.clone()),
        change_tx.clone(),
        cancel.child_token(),
    )
    .await?;
    let pods = kubernetes::watch(
        Api::<KubePod>::all(client.clone()),
        change_tx,
        cancel.child_token(),
    )
    .await?;

    let mut agent = Agent::new(
        StoreSnapshot::new(services, pods),
        Allocator::new(args.cidr),
        store,
        args.hosts_file.clone(),
        Supervisor::new(ApiTunnel::new(client)),
        metrics,
        forwards_tx,
    );

    info!(cidr = %args.cidr, hosts = %args.hosts_file.display(), "agent started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            tick = tick_rx.recv() => {
                if tick.is_none() {
                    break;
                }
                agent.metrics.reconciles.inc();
                if let Err(e) = agent.reconcile() {
                    agent.metrics.reconcile_errors.inc();
                    error!(error = %e, "reconcile failed");
                }
            }
        }
    }

    agent.shutdown();
    info!("agent stopped");
    Ok(())
}
