// Background token maintenance
//
// Two loops share the manager state: one refreshes shortly before expiry,
// the other polls the shared token file for writes made by other processes
// and clears locks left behind by crashed holders.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::ManagerState;

pub(crate) fn spawn(state: Arc<ManagerState>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(proactive_refresh_loop(state.clone(), cancel.clone())),
        tokio::spawn(change_detector_loop(state, cancel)),
    ]
}

async fn proactive_refresh_loop(state: Arc<ManagerState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = state.refresh(false) => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Background token refresh failed");
                }
            }
        }

        let delay = state.next_refresh_delay().await;
        tracing::debug!(delay_secs = delay.as_secs(), "Next proactive token refresh scheduled");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!("Proactive refresh loop stopped");
}

async fn change_detector_loop(state: Arc<ManagerState>, cancel: CancellationToken) {
    loop {
        state.poll_store().await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(state.options.poll_interval) => {}
        }
    }
    tracing::debug!("Token change detector stopped");
}
