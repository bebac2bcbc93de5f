use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mixproxy::broadcast::{self, Broadcaster};
use mixproxy::config::{Cli, ProxyConfig};
use mixproxy::monitor::{self, MonitorState};
use mixproxy::registry::Registry;
use mixproxy::relay::{self, RelayContext};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_directive = if args.debug {
        "mixproxy=debug"
    } else {
        "mixproxy=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let config = ProxyConfig::load(&args)?;
    info!(
        "loaded admission policy with {} entries",
        config.policy.len()
    );

    let proxy_listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| eyre!("failed to listen on {}: {e}", config.listen_addr))?;
    let monitor_listener = TcpListener::bind(config.monitor_addr)
        .await
        .map_err(|e| eyre!("monitoring port {} is already in use: {e}", config.monitor_addr))?;

    let (wake_tx, wake_rx) = broadcast::wake_channel();
    let registry = Arc::new(Registry::new(wake_tx));
    let broadcaster = Broadcaster::new(Arc::clone(&registry));
    tokio::spawn(Arc::clone(&broadcaster).run(wake_rx));

    let monitor_state = MonitorState {
        registry: Arc::clone(&registry),
        broadcaster,
    };
    let monitor_addr = config.monitor_addr;
    tokio::spawn(async move {
        info!("monitoring server listening on {monitor_addr}");
        if let Err(e) = monitor::serve(monitor_listener, monitor_state).await {
            warn!("monitoring server error: {e}");
            warn!("monitoring dashboard will not be available");
        }
    });

    info!("proxy server listening on {}", config.listen_addr);
    info!("HTTP/HTTPS proxy configuration: http://{}", config.listen_addr);
    info!("SOCKS5 proxy configuration: socks5://{}", config.listen_addr);

    let ctx = Arc::new(RelayContext {
        registry: Arc::clone(&registry),
        policy: config.policy.clone(),
    });

    // Run the accept loop until the shutdown signal is received; dropping
    // the loop closes the listener while in-flight connections continue.
    let server = relay::serve_proxy(proxy_listener, ctx);

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {}
    }

    let active = registry.active_count();
    if active > 0 {
        info!("Waiting for {} connections to close...", active);

        for i in 1..=30 {
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            let remaining = registry.active_count();

            if remaining == 0 {
                info!("All connections closed gracefully");
                break;
            }

            if i % 5 == 0 {
                info!("Still waiting for {} connections... ({}/30s)", remaining, i);
            }
        }

        let final_count = registry.active_count();
        if final_count > 0 {
            warn!("Forced shutdown with {} connections still active", final_count);
        }
    }
    info!("Server shutdown complete");

    Ok(())
}
