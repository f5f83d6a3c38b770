//! Keeps one instance registered, heartbeated and state-correct in a ring.

use crate::{
    kv::{KvError, KvStore},
    Desc, Error, InstanceDesc, InstanceState, Result,
};
use observability_deps::tracing::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracedb_time::TimeProvider;

/// Configuration of one ring member.
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// Key of the ring document this instance joins.
    pub ring_key: String,
    /// This instance's id in the ring.
    pub instance_id: String,
    /// Dial address advertised to peers.
    pub addr: String,
    /// Tokens generated at first bootstrap.
    pub num_tokens: usize,
    /// How often the entry's heartbeat is refreshed.
    pub heartbeat_period: Duration,
    /// Where tokens are persisted so restarts keep data locality
    /// (`None` regenerates on every start).
    pub tokens_file_path: Option<PathBuf>,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            ring_key: "collectors/ring".to_string(),
            instance_id: "ingester-0".to_string(),
            addr: "localhost:0".to_string(),
            num_tokens: 128,
            heartbeat_period: Duration::from_secs(5),
            tokens_file_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTokens {
    tokens: Vec<u32>,
}

/// Manages one instance's ring entry across its lifetime.
#[derive(Debug)]
pub struct Lifecycler {
    kv: Arc<dyn KvStore>,
    config: LifecyclerConfig,
    time_provider: Arc<dyn TimeProvider>,
    tokens: Vec<u32>,
}

impl Lifecycler {
    /// Build a lifecycler; tokens are loaded from the tokens file when one
    /// exists, otherwise generated and persisted.
    pub fn new(
        kv: Arc<dyn KvStore>,
        config: LifecyclerConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, std::io::Error> {
        let tokens = Self::load_or_generate_tokens(&config)?;
        Ok(Self {
            kv,
            config,
            time_provider,
            tokens,
        })
    }

    fn load_or_generate_tokens(config: &LifecyclerConfig) -> Result<Vec<u32>, std::io::Error> {
        if let Some(path) = &config.tokens_file_path {
            if path.exists() {
                let bytes = std::fs::read(path)?;
                match serde_json::from_slice::<PersistedTokens>(&bytes) {
                    Ok(persisted) if persisted.tokens.len() == config.num_tokens => {
                        info!(path = %path.display(), "reusing persisted ring tokens");
                        return Ok(persisted.tokens);
                    }
                    Ok(_) | Err(_) => {
                        warn!(path = %path.display(), "tokens file unusable, regenerating");
                    }
                }
            }
        }

        let mut rng = rand::thread_rng();
        let mut tokens: Vec<u32> = (0..config.num_tokens).map(|_| rng.gen()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        while tokens.len() < config.num_tokens {
            tokens.push(rng.gen());
            tokens.sort_unstable();
            tokens.dedup();
        }

        if let Some(path) = &config.tokens_file_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec(&PersistedTokens {
                tokens: tokens.clone(),
            })
            .expect("tokens serialize");
            std::fs::write(path, bytes)?;
        }
        Ok(tokens)
    }

    /// The tokens this instance owns.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Insert (or reclaim) this instance's entry in `state`.
    pub async fn register(&self, state: InstanceState) -> Result<()> {
        let entry = InstanceDesc {
            addr: self.config.addr.clone(),
            state,
            tokens: self.tokens.clone(),
            last_heartbeat: self.time_provider.now().timestamp_nanos(),
        };
        let instance_id = self.config.instance_id.clone();
        self.mutate(move |desc| {
            desc.instances.insert(instance_id, entry);
        })
        .await;
        info!(
            instance = %self.config.instance_id,
            ring = %self.config.ring_key,
            ?state,
            "registered in ring",
        );
        Ok(())
    }

    /// Advertise a new state, keeping tokens and refreshing the heartbeat.
    pub async fn set_state(&self, state: InstanceState) -> Result<()> {
        let instance_id = self.config.instance_id.clone();
        let now = self.time_provider.now().timestamp_nanos();
        // the entry must already exist; a missing entry means we were
        // forcibly removed and must not resurrect ourselves silently
        let found = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let probe = Arc::clone(&found);
        self.mutate(move |desc| {
            match desc.instances.get_mut(&instance_id) {
                Some(entry) => {
                    entry.state = state;
                    entry.last_heartbeat = now;
                }
                None => probe.store(false, std::sync::atomic::Ordering::SeqCst),
            }
        })
        .await;
        if !found.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::NotRegistered {
                instance: self.config.instance_id.clone(),
            });
        }
        info!(instance = %self.config.instance_id, ?state, "ring state changed");
        Ok(())
    }

    /// Remove this instance's entry entirely.
    pub async fn deregister(&self) {
        let instance_id = self.config.instance_id.clone();
        self.mutate(move |desc| {
            desc.instances.remove(&instance_id);
        })
        .await;
        info!(instance = %self.config.instance_id, "deregistered from ring");
    }

    /// Refresh the heartbeat every `heartbeat_period` until `shutdown`.
    pub async fn heartbeat_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_period) => {}
                _ = shutdown.cancelled() => return,
            }

            let instance_id = self.config.instance_id.clone();
            let now = self.time_provider.now().timestamp_nanos();
            self.mutate(move |desc| {
                if let Some(entry) = desc.instances.get_mut(&instance_id) {
                    entry.last_heartbeat = now;
                }
            })
            .await;
        }
    }

    async fn mutate(&self, f: impl FnOnce(&mut Desc) + Send + 'static) {
        let result: Result<(), KvError> = self
            .kv
            .cas(
                &self.config.ring_key,
                Box::new(move |current| {
                    let mut desc = current.unwrap_or_default();
                    f(&mut desc);
                    Some(desc)
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, ring = %self.config.ring_key, "ring update failed");
        }
    }
}
