use std::sync::Arc;

use clap::Parser;
use kubetransport::config::Args;
use kubetransport::metrics::Metrics;
use kubetransport::{Error, Result, agent, http};
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_subscriber();

    let mut registry = Registry::with_prefix("kubetransport");
    let metrics = Metrics::default().register(&mut registry);
    let (forwards_tx, forwards_rx) = watch::channel(Vec::new());

    let cancel = tokio_util::sync::CancellationToken::new();
    let http_state = Arc::new(http::State::new(registry, forwards_rx));
    let mut http_handle = tokio::spawn(http::serve(
        args.diag_address,
        http_state,
        cancel.child_token(),
    ));
    let mut agent_handle = tokio::spawn(agent::start(
        args,
        metrics,
        forwards_tx,
        cancel.child_token(),
    ));
    let mut shutdown_handle = tokio::spawn(shutdown_signal());

    tokio::select! {
        h = &mut http_handle => exit("diagnostics", h)?,
        h = &mut agent_handle => exit("agent", h)?,
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (http_res, agent_res) = tokio::join!(http_handle, agent_handle);
            if let Err(e) = http_res {
                error!("diagnostics exited with error: {}", e);
            }
            if let Err(e) = agent_res {
                error!("agent exited with error: {}", e);
            }
        }
    };
    info!("Exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubetransport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(Error::Task(e.to_string()))
        }
    }
}
