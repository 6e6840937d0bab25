use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub type Selector = BTreeMap<String, String>;

/// Identity of a namespaced cluster resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Ok(());
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub key: ResourceKey,
    pub selector: Selector,
    pub ports: Vec<ServicePort>,
}

impl Service {
    /// A service without a selector (`default/kubernetes` and friends) has
    /// nothing to forward to and is carried through the pipeline as invalid.
    pub fn manageable(&self) -> bool {
        !self.selector.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    pub target_number: Option<u16>,
    pub target_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub key: ResourceKey,
    pub labels: Selector,
    pub ports: Vec<PodPort>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPort {
    pub port: u16,
    pub name: Option<String>,
}

/// One service paired with every pod its selector matches in its namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Association {
    pub service: Service,
    pub pods: Vec<Pod>,
}

impl Association {
    /// The single pod the tunnel targets. Lexicographically smallest name so
    /// the choice is deterministic for an unchanged membership.
    pub fn preferred_pod(&self) -> Option<&Pod> {
        self.pods.iter().min_by(|a, b| a.key.name.cmp(&b.key.name))
    }

    pub fn phase(&self) -> Status {
        if !self.service.manageable() {
            Status::Invalid
        } else if self.pods.is_empty() {
            Status::WaitPod
        } else {
            Status::Setup
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "INVALID")]
    Invalid,
    #[serde(rename = "WAIT_POD")]
    WaitPod,
    #[serde(rename = "SETUP_LISTEN")]
    Setup,
    #[serde(rename = "LISTENING")]
    Listening,
    #[serde(rename = "ACTIVE")]
    Active,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Invalid => "INVALID",
            Status::WaitPod => "WAIT_POD",
            Status::Setup => "SETUP_LISTEN",
            Status::Listening => "LISTENING",
            Status::Active => "ACTIVE",
        };
        f.write_str(s)
    }
}

/// Desired-state record for one service, rebuilt fresh every reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub service: Service,
    pub pod: Option<Pod>,
    pub local_ip: Option<Ipv4Addr>,
    pub status: Status,
    pub last_error: Option<String>,
}

impl Forward {
    /// Total order over forwards. Everything that depends on iteration order
    /// (hosts file, diagnostics JSON) sorts by this key to keep diffs stable.
    pub fn sort_key(&self) -> String {
        let pod = self
            .pod
            .as_ref()
            .map(|p| p.key.to_string())
            .unwrap_or_default();
        let ip = self
            .local_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        format!(
            "svc:{} pod:{} localip:{} status:{}",
            self.service.key, pod, ip, self.status
        )
    }
}

/// Picks the pod-side container port for one service port: numeric target
/// first, then the name resolved against the pod's ports, else the service
/// port itself.
pub fn resolve_target_port(sp: &ServicePort, pod: &Pod) -> u16 {
    if let Some(n) = sp.target_number {
        return n;
    }
    if let Some(name) = sp.target_name.as_deref()
        && let Some(pp) = pod.ports.iter().find(|pp| pp.name.as_deref() == Some(name))
    {
        return pp.port;
    }
    sp.port
}

#[cfg(test)]
mod test {
    use super::*;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            key: ResourceKey::new(ns, name),
            labels: Selector::new(),
            ports: vec![],
        }
    }

    fn service(ns: &str, name: &str) -> Service {
        Service {
            key: ResourceKey::new(ns, name),
            selector: Selector::from([("app".to_string(), name.to_string())]),
            ports: vec![],
        }
    }

    #[test]
    fn test_sort_key_format() {
        let fwd = Forward {
            service: service("default", "foo"),
            pod: Some(pod("default", "foo123")),
            local_ip: Some(Ipv4Addr::new(127, 0, 16, 1)),
            status: Status::Active,
            last_error: None,
        };
        assert_eq!(
            fwd.sort_key(),
            "svc:default/foo pod:default/foo123 localip:127.0.16.1 status:ACTIVE"
        );
    }

    #[test]
    fn test_sort_key_empty_parts() {
        let fwd = Forward {
            service: service("default", "foo"),
            pod: None,
            local_ip: None,
            status: Status::WaitPod,
            last_error: None,
        };
        assert_eq!(fwd.sort_key(), "svc:default/foo pod: localip: status:WAIT_POD");
    }

    #[test]
    fn test_preferred_pod_is_smallest_name() {
        let assoc = Association {
            service: service("default", "foo"),
            pods: vec![
                pod("default", "foo-c"),
                pod("default", "foo-a"),
                pod("default", "foo-b"),
            ],
        };
        assert_eq!(assoc.preferred_pod().unwrap().key.name, "foo-a");
    }

    #[test]
    fn test_phase() {
        let mut assoc = Association {
            service: service("default", "foo"),
            pods: vec![],
        };
        assert_eq!(assoc.phase(), Status::WaitPod);

        assoc.pods.push(pod("default", "foo123"));
        assert_eq!(assoc.phase(), Status::Setup);

        assoc.service.selector.clear();
        assert_eq!(assoc.phase(), Status::Invalid);
    }

    #[test]
    fn test_resolve_target_port() {
        let mut p = pod("default", "foo123");
        p.ports = vec![
            PodPort {
                port: 9000,
                name: Some("web".into()),
            },
            PodPort {
                port: 9090,
                name: None,
            },
        ];

        let by_number = ServicePort {
            port: 80,
            target_number: Some(8080),
            target_name: None,
        };
        assert_eq!(resolve_target_port(&by_number, &p), 8080);

        let by_name = ServicePort {
            port: 80,
            target_number: None,
            target_name: Some("web".into()),
        };
        assert_eq!(resolve_target_port(&by_name, &p), 9000);

        let unresolved_name = ServicePort {
            port: 80,
            target_number: None,
            target_name: Some("missing".into()),
        };
        assert_eq!(resolve_target_port(&unresolved_name, &p), 80);

        let bare = ServicePort {
            port: 8080,
            target_number: None,
            target_name: None,
        };
        assert_eq!(resolve_target_port(&bare, &p), 8080);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&Status::WaitPod).unwrap(),
            "\"WAIT_POD\""
        );
        assert_eq!(
            serde_json::to_string(&Status::Setup).unwrap(),
            "\"SETUP_LISTEN\""
        );
    }
}
