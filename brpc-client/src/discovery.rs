//! Service discovery.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
}

impl FromStr for SelectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(SelectMode::Random),
            "round-robin" | "roundrobin" | "round_robin" => Ok(SelectMode::RoundRobin),
            other => Err(format!("unknown select mode: {}", other)),
        }
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectMode::Random => write!(f, "random"),
            SelectMode::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// A source of server endpoints (`protocol@address`).
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Reloads the endpoint list from its source.
    async fn refresh(&self) -> Result<(), DiscoveryError>;

    /// Replaces the endpoint list.
    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError>;

    /// Picks one endpoint, avoiding `exclude` when another is available.
    async fn get(&self, mode: SelectMode, exclude: Option<&str>) -> Result<String, DiscoveryError>;

    /// Returns every endpoint.
    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError>;
}

/// Discovery over a list of endpoints supplied by the caller.
pub struct StaticDiscovery {
    servers: RwLock<Vec<String>>,
    rng: Mutex<StdRng>,
    index: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        // Start at a random offset so clients do not all hit the first server.
        let index = rng.gen::<u32>() as usize;
        Self {
            servers: RwLock::new(servers),
            rng: Mutex::new(rng),
            index: AtomicUsize::new(index),
        }
    }

    fn select(&self, mode: SelectMode, exclude: Option<&str>) -> Result<String, DiscoveryError> {
        let servers = self.servers.read();
        let mut candidates: Vec<&String> = servers
            .iter()
            .filter(|s| Some(s.as_str()) != exclude)
            .collect();
        if candidates.is_empty() {
            candidates = servers.iter().collect();
        }

        let n = candidates.len();
        if n == 0 {
            return Err(DiscoveryError::NoServers);
        }
        let pick = match mode {
            SelectMode::Random => self.rng.lock().gen_range(0..n),
            // The index keeps growing; reducing modulo the current length
            // stays valid when the list shrinks.
            SelectMode::RoundRobin => self.index.fetch_add(1, Ordering::Relaxed) % n,
        };
        Ok(candidates[pick].clone())
    }
}

impl fmt::Debug for StaticDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDiscovery")
            .field("servers", &*self.servers.read())
            .finish()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        tracing::debug!("rpc discovery: updating to {} servers", servers.len());
        *self.servers.write() = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode, exclude: Option<&str>) -> Result<String, DiscoveryError> {
        self.select(mode, exclude)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.servers.read().clone())
    }
}
