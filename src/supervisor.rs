//! Process supervisor: owns the server and client halves

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::Config;
use crate::{client, server};

/// Run the halves present in `config` until `shutdown` fires.
///
/// Each half runs in its own task. Cancellation tears down the active
/// sessions, every per-port listener, and all pending slots before this
/// returns.
pub async fn run(config: Config, shutdown: CancellationToken) {
    let mut tasks = Vec::new();

    if let Some(server_config) = config.server {
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run(server_config, token).await {
                error!("server failed: {}", e);
            }
        }));
    }

    if let Some(client_config) = config.client {
        let token = shutdown.clone();
        tasks.push(tokio::spawn(client::run(client_config, token)));
    }

    for task in tasks {
        let _ = task.await;
    }
}
