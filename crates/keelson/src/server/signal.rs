//! OS termination signals.

use super::lifecycle::{ShutdownHandle, Trigger};
use tokio::signal;

/// Resolves with the first of Ctrl+C, SIGTERM or a programmatic
/// [`ShutdownHandle::trigger`].
///
/// A signal listener that cannot be installed is logged and left out; the
/// remaining sources still work.
pub(crate) async fn termination(handle: ShutdownHandle) -> Trigger {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => Trigger::Interrupt,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                Trigger::Terminate
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Trigger>();

    tokio::select! {
        trigger = ctrl_c => trigger,
        trigger = terminate => trigger,
        () = handle.requested() => Trigger::Requested,
    }
}
