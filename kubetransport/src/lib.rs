pub mod agent;
pub mod config;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod state;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("no free address left in {0}")]
    CidrExhausted(ipnet::Ipv4Net),

    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("port-forward carries no stream for port {0}")]
    MissingStream(u16),

    #[error("task error: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
