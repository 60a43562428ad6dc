//! brpc-cli - Command-line client for brpc
//!
//! Issues one-shot calls against running servers, directly or through the
//! load-balancing client.

mod commands;

use brpc_client::{Context, SelectMode};
use brpc_protocol::Options;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "brpc-cli")]
#[command(about = "Command-line client for brpc servers")]
#[command(version)]
struct Cli {
    /// Body codec content type
    #[arg(long, global = true, env = "BRPC_CODEC", default_value = brpc_protocol::CBOR)]
    codec: String,

    /// Give up on the call after this many milliseconds (0 = never)
    #[arg(long, global = true, default_value = "0")]
    timeout_ms: u64,

    /// Ask the server to time out handling after this many milliseconds
    /// (0 = server default)
    #[arg(long, global = true, default_value = "0")]
    handle_timeout_ms: u64,

    /// Connect timeout in milliseconds (0 = unlimited)
    #[arg(long, global = true, default_value = "10000")]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn options(&self) -> Options {
        Options::default()
            .with_codec(self.codec.clone())
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_handle_timeout(Duration::from_millis(self.handle_timeout_ms))
    }

    fn context(&self) -> Context {
        if self.timeout_ms == 0 {
            Context::background()
        } else {
            Context::with_timeout(Duration::from_millis(self.timeout_ms))
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Call a method on one server
    Call {
        /// Server endpoint (protocol@address, e.g. tcp@127.0.0.1:9999)
        endpoint: String,

        /// Method to call (Service.Method)
        method: String,

        /// Argument JSON (or @file.json to read from file)
        #[arg(default_value = "null")]
        args: String,
    },

    /// Call a method on one of several servers
    Xcall {
        /// Server endpoint (repeatable)
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,

        /// Load-balancing mode (random, round-robin)
        #[arg(short, long, default_value = "random")]
        mode: SelectMode,

        /// Retries on another server after a connection failure
        #[arg(short, long, default_value = "0")]
        retries: usize,

        /// Method to call (Service.Method)
        method: String,

        /// Argument JSON (or @file.json to read from file)
        #[arg(default_value = "null")]
        args: String,
    },

    /// Call a method on every server
    Broadcast {
        /// Server endpoint (repeatable)
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,

        /// Method to call (Service.Method)
        method: String,

        /// Argument JSON (or @file.json to read from file)
        #[arg(default_value = "null")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let options = cli.options();
    let ctx = cli.context();

    match commands::execute(&ctx, options, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
