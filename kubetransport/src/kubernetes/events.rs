use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Collapses bursts of change notifications into reconcile ticks.
///
/// The first inbound signal is forwarded immediately. After that the burst
/// is drained: nothing is emitted while signals keep arriving within the
/// quiet window, and once the window passes in silence a single trailing
/// tick goes out. The tick channel has capacity one, so at most one tick is
/// ever outstanding; a storm of inputs yields one tick per quiet window.
pub async fn debounce(
    mut changes: mpsc::Receiver<()>,
    ticks: mpsc::Sender<()>,
    quiet: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            change = changes.recv() => {
                if change.is_none() {
                    return;
                }
                trace!("change observed, ticking");
                if ticks.send(()).await.is_err() {
                    return;
                }

                // Eat the burst. Each further signal restarts the window.
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        change = changes.recv() => {
                            if change.is_none() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(quiet) => break,
                    }
                }
                if ticks.send(()).await.is_err() {
                    return;
                }
            }
        }
    }
}
