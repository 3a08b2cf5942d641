//! Reconnect controller: exponential backoff over full re-login attempts.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use super::{Event, GatewayClient, GatewayError};

/// Kick off disconnect handling on its own task. A no-op when the client is
/// hard-closed or a retry loop is already running.
pub(crate) fn spawn(client: &Arc<GatewayClient>) {
    if client.is_closed() {
        return;
    }
    if client.retrying.swap(true, Ordering::SeqCst) {
        return;
    }
    let client_task = Arc::clone(client);
    let handle = tokio::spawn(async move {
        if let Err(err) = run_retry_loop(&client_task).await {
            warn!(error = %err, "reconnection failed");
        }
        client_task.retrying.store(false, Ordering::SeqCst);
    });
    client.track_task(handle);
}

async fn run_retry_loop(client: &Arc<GatewayClient>) -> Result<(), GatewayError> {
    info!("starting reconnection");
    let policy = client.retry_policy().clone();

    for attempt in 1..=policy.max_attempts {
        if client.is_closed() {
            return Ok(());
        }
        let delay = policy.delay_for(attempt);
        info!(attempt, max = policy.max_attempts, delay = ?delay, "reconnection attempt");

        tokio::select! {
            _ = client.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(err) = attempt_reconnect(client).await {
            warn!(attempt, error = %err, "reconnection attempt failed");
            continue;
        }

        info!("reconnected");
        client.emit(Event::Reconnected);
        return Ok(());
    }

    Err(GatewayError::RetriesExhausted {
        attempts: policy.max_attempts,
    })
}

async fn attempt_reconnect(client: &Arc<GatewayClient>) -> Result<(), GatewayError> {
    // Drop the stale connection before dialing again.
    if let Some(conn) = client.conn.write().await.take() {
        conn.close().await;
    }
    client.login().await
}
