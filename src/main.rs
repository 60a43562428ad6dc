//! brpc - RPC server
//!
//! Hosts the built-in `Arith` service over TCP. Configuration comes from the
//! YAML file named by `BRPC_CONFIG`, then `BRPC_*` environment overrides.

use brpc_protocol::CodecRegistry;
use brpc_server::{Config, Server, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Arith;

fn arith_service() -> Result<Service, brpc_server::RegistryError> {
    Service::builder("Arith", Arith)
        .method("Sum", |_: &Arith, args: Args, reply: &mut i64| {
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .method("Mul", |_: &Arith, args: Args, reply: &mut i64| {
            *reply = args.num1 * args.num2;
            Ok::<_, String>(())
        })
        .method("Div", |_: &Arith, args: Args, reply: &mut i64| {
            if args.num2 == 0 {
                return Err("divide by zero".to_string());
            }
            *reply = args.num1 / args.num2;
            Ok(())
        })
        .method("Sleep", |_: &Arith, args: Args, reply: &mut i64| {
            std::thread::sleep(Duration::from_millis(args.num1.max(0) as u64));
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if BRPC_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("BRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("BRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.validate(&CodecRegistry::default()) {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting brpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    if config.rpc.handle_timeout_ms == 0 {
        tracing::info!("  Default handle timeout: unlimited");
    } else {
        tracing::info!("  Default handle timeout: {}ms", config.rpc.handle_timeout_ms);
    }
    if config.rpc.codecs.is_empty() {
        tracing::info!("  Codecs: all registered");
    } else {
        tracing::info!("  Codecs: {}", config.rpc.codecs.join(", "));
    }

    let server = Arc::new(Server::new(config.server_config()));
    server.register(arith_service()?)?;

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
