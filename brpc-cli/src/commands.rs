//! Command execution.

use crate::Commands;
use brpc_client::{Client, Context, SelectMode, StaticDiscovery, XClient, XClientConfig};
use brpc_protocol::Options;
use colored::Colorize;
use serde_json::Value;
use std::sync::Arc;

/// Executes a command and returns the formatted output.
pub async fn execute(
    ctx: &Context,
    options: Options,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Call {
            endpoint,
            method,
            args,
        } => {
            let args = parse_json_arg(&args)?;
            let client = Client::xdial(&endpoint, options).await?;
            let result = client.call_value(ctx, &method, &args).await;
            client.close().await?;
            Ok(format_json(&result?))
        }

        Commands::Xcall {
            endpoints,
            mode,
            retries,
            method,
            args,
        } => {
            let args = parse_json_arg(&args)?;
            let xclient = xclient(endpoints, mode, options)
                .with_config(XClientConfig::new().with_retries(retries));
            let result = xclient.call_value(ctx, &method, &args).await;
            xclient.close().await?;
            Ok(format_json(&result?))
        }

        Commands::Broadcast {
            endpoints,
            method,
            args,
        } => {
            let args = parse_json_arg(&args)?;
            let count = endpoints.len();
            let xclient = xclient(endpoints, SelectMode::Random, options);
            let mut reply = Value::Null;
            let result = xclient.broadcast(ctx, &method, &args, &mut reply).await;
            xclient.close().await?;
            result?;
            Ok(format!(
                "{} {} on {} servers\n{}",
                "Broadcast".green(),
                method.cyan(),
                count,
                format_json(&reply)
            ))
        }
    }
}

fn xclient(endpoints: Vec<String>, mode: SelectMode, options: Options) -> XClient {
    XClient::new(Arc::new(StaticDiscovery::new(endpoints)), mode, options)
}

/// Parses a JSON argument, or reads it from a file when prefixed with `@`.
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
