//! Wires the gateway together and runs it until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tether_gateway::{
    BroadcastRetryQueue, Gateway, GatewayContext, LocalFabric, StaticTokenAuthenticator,
};

use crate::config::Config;

/// Runs the gateway until Ctrl-C or a server error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let gateway_config = config.gateway_config()?;

    // Single-node deployment: the fabric stays in process.
    let fabric = Arc::new(LocalFabric::new());
    let tokens: HashMap<String, String> = config.tokens.clone().into_iter().collect();
    if tokens.is_empty() {
        tracing::warn!("no tokens configured, every handshake will be rejected");
    }
    let authenticator = Arc::new(StaticTokenAuthenticator::new(tokens));

    let ctx = GatewayContext {
        retry_queue: Arc::new(BroadcastRetryQueue::new(config.retry_capacity)),
        ..GatewayContext::new(fabric, authenticator)
    };
    let gateway = Gateway::new(gateway_config, ctx);

    let server = Arc::clone(&gateway);
    let mut server_task = tokio::spawn(async move { server.run().await });

    // Wait for the server to bind.
    let addr = loop {
        if let Some(addr) = gateway.local_addr().await {
            break addr;
        }
        if server_task.is_finished() {
            return Err(early_exit(&mut server_task).await);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    tracing::info!(name = %config.name, node = %gateway.node_id(), %addr, "gateway listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        result = &mut server_task => {
            result??;
            return Ok(());
        }
    }

    gateway.shutdown();
    server_task.await??;
    Ok(())
}

/// Error of a server task that ended before binding.
async fn early_exit(
    task: &mut tokio::task::JoinHandle<Result<(), tether_gateway::GatewayError>>,
) -> anyhow::Error {
    match task.await {
        Ok(Err(e)) => e.into(),
        Err(e) => e.into(),
        Ok(Ok(())) => anyhow::anyhow!("gateway stopped before binding"),
    }
}
