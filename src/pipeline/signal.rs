//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = handlers else {
        warn!("Failed to install signal handlers, shutdown signals are ignored");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(message = "Signal received.", signal = "ctrl-c");
    } else {
        warn!("Failed to install ctrl-c handler, shutdown signals are ignored");
        std::future::pending::<()>().await;
    }
}

/// Exit status used when a second signal interrupts a partition.
const FORCED_EXIT_CODE: i32 = 130;

/// A token cancelled by the first shutdown signal. A second signal exits the
/// process at once.
pub fn shutdown_token() -> CancellationToken {
    watch_signals(shutdown_signal, || {
        warn!("Second signal received, exiting without finishing the current partition");
        std::process::exit(FORCED_EXIT_CODE);
    })
}

/// Cancel the returned token on the first signal and call `on_repeat` on the
/// second.
fn watch_signals<S, Fut, F>(mut next_signal: S, on_repeat: F) -> CancellationToken
where
    S: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            next_signal().await;
            info!("Finishing the current partition before stopping, signal again to exit now");
            shutdown.cancel();

            next_signal().await;
            on_repeat();
        }
    });
    shutdown
}
