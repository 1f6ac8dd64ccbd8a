use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use webssh_proxy::config::ProxyConfig;
use webssh_proxy::{bridge, init_logging, ProxyState};

#[tokio::main]
async fn main() {
    init_logging();

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(1);
        }
    };
    info!("Starting with {:?}", config);

    let bind_address = config.bind_address.clone();
    let state = match ProxyState::from_config(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize proxy state: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = bridge::serve(listener, state.terminal.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
        }
    }

    state.shutdown().await;
}
