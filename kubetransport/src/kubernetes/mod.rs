pub mod events;

use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::pin::pin;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod as KubePod, Service as KubeService};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::agent::forward::Tunnel;
use crate::state::{Pod, PodPort, ResourceKey, Selector, Service, ServicePort};
use crate::{Error, Result};

/// Builds a client from an explicit kubeconfig, or through the standard
/// resolution order when none is given. Auth (exec plugins and friends) is
/// entirely the client library's business.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

pub fn selector_matches(selector: &Selector, labels: &Selector) -> bool {
    for (k, v) in selector {
        if labels.get(k) != Some(v) {
            return false;
        }
    }
    true
}

/// Starts a watch for one resource kind. The returned store is the local
/// cache snapshots are read from; every observed change additionally pokes
/// the event channel (lossy by design, the debouncer coalesces anyway).
pub async fn watch<K>(
    api: Api<K>,
    changes: mpsc::Sender<()>,
    cancel: CancellationToken,
) -> Result<Store<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();

    let stream = watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(writer);

    tokio::spawn(async move {
        let mut stream = pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => {
                        trace!("received event: {:?}", ev);
                        let _ = changes.try_send(());
                    }
                    Some(Err(e)) => error!(%e, "unexpected error with watch stream"),
                    None => {
                        error!("watch stream ended");
                        return;
                    }
                },
            }
        }
    });

    reader
        .wait_until_ready()
        .await
        .map_err(|e| Error::StoreCreation(e.to_string()))?;
    Ok(reader)
}

fn service_port(p: &k8s_openapi::api::core::v1::ServicePort) -> Option<ServicePort> {
    if p.protocol.as_deref().unwrap_or("TCP") != "TCP" {
        return None;
    }
    let port = u16::try_from(p.port).ok()?;
    let (target_number, target_name) = match &p.target_port {
        Some(IntOrString::Int(n)) => (u16::try_from(*n).ok(), None),
        Some(IntOrString::String(s)) => (None, Some(s.clone())),
        None => (None, None),
    };
    Some(ServicePort {
        port,
        target_number,
        target_name,
    })
}

pub fn service_from_kube(svc: &KubeService) -> Option<Service> {
    let key = ResourceKey::new(svc.namespace()?, svc.name_any());
    let spec = svc.spec.as_ref();
    let selector = spec.and_then(|s| s.selector.clone()).unwrap_or_default();
    let ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().filter_map(service_port).collect())
        .unwrap_or_default();
    Some(Service {
        key,
        selector,
        ports,
    })
}

pub fn pod_from_kube(pod: &KubePod) -> Option<Pod> {
    let key = ResourceKey::new(pod.namespace()?, pod.name_any());
    let labels = pod.labels().clone();
    let ports = pod
        .spec
        .iter()
        .flat_map(|s| &s.containers)
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|cp| {
            u16::try_from(cp.container_port).ok().map(|port| PodPort {
                port,
                name: cp.name.clone(),
            })
        })
        .collect();
    Some(Pod { key, labels, ports })
}

/// Where the reconciler gets its per-tick view of the cluster from. The
/// production implementation reads the reflector stores; tests script it.
pub trait ClusterSnapshot {
    fn services(&self) -> Result<Vec<Service>>;
    fn pods(&self) -> Result<Vec<Pod>>;
}

pub struct StoreSnapshot {
    services: Store<KubeService>,
    pods: Store<KubePod>,
}

impl StoreSnapshot {
    pub fn new(services: Store<KubeService>, pods: Store<KubePod>) -> Self {
        Self { services, pods }
    }
}

impl ClusterSnapshot for StoreSnapshot {
    fn services(&self) -> Result<Vec<Service>> {
        // Store order is arbitrary; sort so allocation of new services and
        // every order-dependent output stay stable between ticks.
        let mut out: Vec<Service> = self
            .services
            .state()
            .iter()
            .filter_map(|s| service_from_kube(s))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn pods(&self) -> Result<Vec<Pod>> {
        let mut out: Vec<Pod> = self
            .pods
            .state()
            .iter()
            .filter_map(|p| pod_from_kube(p))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

/// Tunnels an accepted connection through the API server's port-forward
/// endpoint to the pod.
#[derive(Clone)]
pub struct ApiTunnel {
    client: Client,
}

impl ApiTunnel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Tunnel for ApiTunnel {
    async fn proxy(&self, pod: &ResourceKey, port: u16, mut conn: TcpStream) -> Result<()> {
        let pods: Api<KubePod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut pf = pods.portforward(&pod.name, &[port]).await?;
        let mut upstream = pf.take_stream(port).ok_or(Error::MissingStream(port))?;
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        drop(upstream);
        pf.join().await.map_err(|e| Error::Task(e.to_string()))?;
        Ok(())
    }
}
