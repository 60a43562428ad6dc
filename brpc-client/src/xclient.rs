//! Load-balanced client over a [`Discovery`].
//!
//! Connections are dialled on first use and cached per endpoint; a cached
//! client that has shut down is evicted and redialled.

use crate::client::Client;
use crate::context::Context;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{ClientError, DiscoveryError};
use brpc_protocol::codec::{from_value, to_value};
use brpc_protocol::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// XClient configuration.
#[derive(Debug, Clone, Default)]
pub struct XClientConfig {
    /// Extra attempts on another endpoint after a connection-level failure.
    pub retries: usize,
}

impl XClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }
}

pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    config: XClientConfig,
    clients: tokio::sync::Mutex<HashMap<String, Arc<Client>>>,
}

#[derive(Default)]
struct BroadcastState {
    error: Option<ClientError>,
    reply: Option<Value>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            config: XClientConfig::default(),
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: XClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Returns a live client for `endpoint`, dialling if needed.
    ///
    /// The cache lock is not held while dialling, so a stalled endpoint does
    /// not hold up dials to the others. When two dials to the same endpoint
    /// race, the first one cached wins and the other connection is closed.
    async fn dial(&self, endpoint: &str) -> Result<Arc<Client>, ClientError> {
        let stale = {
            let mut clients = self.clients.lock().await;
            match clients.get(endpoint) {
                Some(client) if client.is_available() => return Ok(client.clone()),
                Some(_) => {
                    tracing::debug!("rpc xclient: evicting unavailable client for {}", endpoint);
                    clients.remove(endpoint)
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            let _ = stale.close().await;
        }

        let client = Arc::new(Client::xdial(endpoint, self.options.clone()).await?);

        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(endpoint).filter(|c| c.is_available()).cloned() {
            drop(clients);
            let _ = client.close().await;
            return Ok(existing);
        }
        let replaced = clients.insert(endpoint.to_string(), client.clone());
        drop(clients);
        if let Some(replaced) = replaced {
            let _ = replaced.close().await;
        }
        Ok(client)
    }

    async fn call_endpoint(
        &self,
        endpoint: &str,
        ctx: &Context,
        service_method: &str,
        args: &Value,
    ) -> Result<Value, ClientError> {
        let client = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            client = self.dial(endpoint) => client?,
        };
        client.call_value(ctx, service_method, args).await
    }

    /// Calls `service_method` on one endpoint chosen by the select mode.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = to_value(args)?;
        let reply = self.call_value(ctx, service_method, &args).await?;
        Ok(from_value(reply)?)
    }

    /// Untyped form of [`XClient::call`].
    pub async fn call_value(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &Value,
    ) -> Result<Value, ClientError> {
        let mut exclude: Option<String> = None;
        let mut attempt = 0;
        loop {
            let endpoint = self.discovery.get(self.mode, exclude.as_deref()).await?;
            match self.call_endpoint(&endpoint, ctx, service_method, args).await {
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    tracing::debug!("rpc xclient: {} failed on {}: {}, retrying", service_method, endpoint, e);
                    attempt += 1;
                    exclude = Some(endpoint);
                }
                result => return result,
            }
        }
    }

    /// Calls `service_method` on every endpoint concurrently.
    ///
    /// The first failure cancels the calls still running and is returned.
    /// The first successful reply is stored in `reply`, even when another
    /// endpoint failed.
    pub async fn broadcast<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(DiscoveryError::NoServers.into());
        }

        let args = to_value(args)?;
        let ctx = ctx.child();
        let state = parking_lot::Mutex::new(BroadcastState::default());

        let calls = servers.iter().map(|endpoint| {
            let (ctx, args, state) = (&ctx, &args, &state);
            async move {
                let result = self.call_endpoint(endpoint, ctx, service_method, args).await;
                let mut state = state.lock();
                match result {
                    Ok(value) => {
                        if state.reply.is_none() {
                            state.reply = Some(value);
                        }
                    }
                    Err(e) => {
                        if state.error.is_none() {
                            tracing::debug!("rpc xclient: broadcast {} failed on {}: {}", service_method, endpoint, e);
                            state.error = Some(e);
                            ctx.cancel();
                        }
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        let state = state.into_inner();
        if let Some(value) = state.reply {
            *reply = from_value(value)?;
        }
        match state.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes and forgets every cached client.
    pub async fn close(&self) -> Result<(), ClientError> {
        let clients: Vec<(String, Arc<Client>)> = self.clients.lock().await.drain().collect();
        for (endpoint, client) in clients {
            if let Err(e) = client.close().await {
                tracing::debug!("rpc xclient: close {} failed: {}", endpoint, e);
            }
        }
        Ok(())
    }

    /// Number of cached clients.
    pub async fn connection_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}
