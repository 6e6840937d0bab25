use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use ipnet::Ipv4Net;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Hosts file to keep in sync
    #[arg(long, default_value = "./myhosts")]
    pub hosts_file: PathBuf,

    /// Kubeconfig to use instead of the standard resolution order
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Loopback prefix service addresses are drawn from
    #[arg(long, default_value = "127.0.16.0/24")]
    pub cidr: Ipv4Net,

    /// Quiet window before a burst of cluster events becomes one reconcile, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    pub debounce: u64,

    /// Database holding the service address allocations
    #[arg(long, default_value = "./kubetransport.db")]
    pub state_db: PathBuf,

    /// Diagnostics listener (/readyz, /metrics, /state)
    #[arg(long, default_value = "127.0.0.1:9642")]
    pub diag_address: SocketAddr,
}
