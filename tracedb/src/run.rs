//! Role wiring: from a parsed [`Config`] to a running set of services.

use crate::{
    config::{BackendKind, CacheKind, Config},
    http,
    service::ServiceManager,
};
use data_types::{Overrides, TraceCombiner};
use distributor::{Distributor, DistributorConfig};
use ingester::{Ingester, IngesterConfig};
use ingester_client::{IngesterClient, StaticPool};
use object_backend::{
    cache::{CachingBackend, MemCache},
    hedge::HedgedReader,
    ObjectStoreBackend, RawReader, RawWriter,
};
use observability_deps::tracing::{info, warn};
use ring::{
    kv::{KvStore, MemKvStore},
    lifecycler::{Lifecycler, LifecyclerConfig},
    InstanceState, Ring,
};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use trace_store::{StoreConfig, TraceStore};
use tracedb_time::{SystemProvider, TimeProvider};

/// The role this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum Target {
    /// Every role in one process.
    All,
    Distributor,
    Ingester,
    Querier,
    QueryFrontend,
    Compactor,
}

/// Startup and runtime failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid http listen address {addr}: {source}")]
    BadListenAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("storage backend {kind:?} requires external credentials/configuration and the matching object_backend feature; configure it through the deployment tooling")]
    UnsupportedBackend { kind: BackendKind },

    #[error("cannot prepare storage: {0}")]
    Storage(#[from] object_backend::Error),

    #[error("cannot initialize ingester: {0}")]
    Ingester(#[from] ingester::Error),

    #[error("io error during startup: {0}")]
    Io(#[from] std::io::Error),

    #[error("ring error: {0}")]
    Ring(#[from] ring::Error),

    /// A subservice died after startup completed.
    #[error("service failure: {0}")]
    ServiceFailed(String),
}

/// Build and run the selected role until shutdown. Blocks for the process
/// lifetime.
pub async fn run(target: Target, config: Config) -> Result<(), RunError> {
    let http_addr: SocketAddr =
        config
            .server
            .http_listen_addr
            .parse()
            .map_err(|source| RunError::BadListenAddr {
                addr: config.server.http_listen_addr.clone(),
                source,
            })?;

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let metric_registry = Arc::new(metric::Registry::new());
    let combiner = Arc::new(TraceCombiner);
    let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::default());

    let store = Arc::new(build_store(&config, Arc::clone(&combiner) as _)?);
    let overrides = Arc::new(Overrides::new(
        config.overrides.defaults,
        config.overrides.tenants.clone(),
    ));

    let ingester_ring = Ring::new(
        Arc::clone(&kv),
        config.ring.ingester_ring_key.clone(),
        config.ring.replication_factor,
        config.ring.heartbeat_timeout,
        Arc::clone(&time_provider),
    );

    let mut manager = ServiceManager::new();

    // the readiness listener comes up first so orchestration sees 503
    // rather than connection refused during startup
    let ready = manager.ready_flag();
    manager.start_service("http", move |shutdown| {
        http::serve(http_addr, ready, shutdown)
    });

    let wants_store_poller = matches!(
        target,
        Target::All | Target::Querier | Target::QueryFrontend | Target::Ingester
    );
    if wants_store_poller {
        let store = Arc::clone(&store);
        manager.start_service("blocklist-poller", move |shutdown| async move {
            store.poll_loop(shutdown).await;
            Ok(())
        });
    }

    let mut ingester_handle: Option<Arc<Ingester>> = None;
    if matches!(target, Target::All | Target::Ingester) {
        let ingester = Arc::new(Ingester::new(
            IngesterConfig {
                max_block_bytes: config.ingester.max_block_bytes,
                max_block_duration: config.ingester.max_block_duration,
                trace_idle_period: config.ingester.trace_idle_period,
                max_trace_idle: config.ingester.max_trace_idle,
                flush_check_period: config.ingester.flush_check_period,
                complete_block_timeout: config.ingester.complete_block_timeout,
                concurrent_flushes: config.ingester.concurrent_flushes,
                flush_queue_depth: config.ingester.flush_queue_depth,
                wal_path: config.storage.wal_path.clone(),
                local_blocks_path: config.ingester.local_blocks_path.clone(),
                block_options: Default::default(),
            },
            Arc::clone(&overrides),
            Arc::clone(&store),
            Arc::clone(&combiner) as _,
            Arc::clone(&time_provider),
            &metric_registry,
        )?);

        let lifecycler = Arc::new(Lifecycler::new(
            Arc::clone(&kv),
            LifecyclerConfig {
                ring_key: config.ring.ingester_ring_key.clone(),
                instance_id: config.server.instance_id.clone(),
                addr: config.server.instance_id.clone(),
                num_tokens: config.ring.num_tokens,
                heartbeat_period: config.ring.heartbeat_period,
                tokens_file_path: config.ring.tokens_file_path.clone(),
            },
            Arc::clone(&time_provider),
        )?);

        // JOINING while the wal replays, ACTIVE once recovery finished
        lifecycler.register(InstanceState::Joining).await?;
        ingester.start().await?;
        lifecycler.set_state(InstanceState::Active).await?;

        {
            let lifecycler = Arc::clone(&lifecycler);
            manager.start_service("ingester-lifecycler", move |shutdown| async move {
                lifecycler.heartbeat_loop(shutdown).await;
                lifecycler.deregister().await;
                Ok(())
            });
        }
        {
            let ingester = Arc::clone(&ingester);
            let lifecycler = Arc::clone(&lifecycler);
            manager.start_service("ingester", move |shutdown| async move {
                Arc::clone(&ingester).run(shutdown).await;
                // drain: advertise LEAVING, then final cut + flush
                let _ = lifecycler.set_state(InstanceState::Leaving).await;
                ingester.stop().await.map_err(|e| e.to_string())
            });
        }

        ingester_handle = Some(ingester);
    }

    if matches!(target, Target::All | Target::Distributor) {
        let pool = match &ingester_handle {
            Some(ingester) => StaticPool::new([(
                config.server.instance_id.clone(),
                Arc::clone(ingester) as Arc<dyn IngesterClient>,
            )]),
            None => {
                // reaching remote ingesters needs a transport client,
                // which is deployed as a separate component
                warn!("distributor running without in-process ingesters; attach a transport-backed ingester pool");
                StaticPool::default()
            }
        };

        let distributor_lifecycler = Arc::new(Lifecycler::new(
            Arc::clone(&kv),
            LifecyclerConfig {
                ring_key: config.distributor.override_ring_key.clone(),
                instance_id: config.server.instance_id.clone(),
                addr: config.server.instance_id.clone(),
                num_tokens: 1,
                heartbeat_period: config.ring.heartbeat_period,
                tokens_file_path: None,
            },
            Arc::clone(&time_provider),
        )?);
        distributor_lifecycler
            .register(InstanceState::Active)
            .await?;

        let distributor_ring = Ring::new(
            Arc::clone(&kv),
            config.distributor.override_ring_key.clone(),
            1,
            config.ring.heartbeat_timeout,
            Arc::clone(&time_provider),
        );

        let distributor = Arc::new(Distributor::new(
            ingester_ring.clone(),
            Some(distributor_ring),
            Arc::new(pool),
            Arc::clone(&overrides),
            DistributorConfig {
                extend_writes: config.distributor.extend_writes,
                remote_timeout: config.distributor.remote_timeout,
                log_received_traces: config.distributor.log_received_traces,
            },
            Arc::clone(&time_provider),
            &metric_registry,
        ));

        // receivers (OTLP, Jaeger, ...) are separate components feeding
        // `Distributor::push`; this service parks the distributor until
        // shutdown
        manager.start_service("distributor", move |shutdown| async move {
            let lifecycler = distributor_lifecycler;
            let heartbeat = lifecycler.heartbeat_loop(shutdown);
            heartbeat.await;
            lifecycler.deregister().await;
            drop(distributor);
            Ok(())
        });
    }

    if matches!(target, Target::All | Target::Compactor) {
        let compactor_lifecycler = Arc::new(Lifecycler::new(
            Arc::clone(&kv),
            LifecyclerConfig {
                ring_key: "compactors/ring".to_string(),
                instance_id: config.server.instance_id.clone(),
                addr: config.server.instance_id.clone(),
                num_tokens: config.ring.num_tokens,
                heartbeat_period: config.ring.heartbeat_period,
                tokens_file_path: None,
            },
            Arc::clone(&time_provider),
        )?);
        compactor_lifecycler.register(InstanceState::Active).await?;

        let compactor_ring = Ring::new(
            Arc::clone(&kv),
            "compactors/ring",
            1,
            config.ring.heartbeat_timeout,
            Arc::clone(&time_provider),
        );

        let compactor = Arc::new(compactor::Compactor::new(
            Arc::clone(&store),
            Arc::clone(&overrides),
            Arc::clone(&combiner) as _,
            Arc::clone(&time_provider),
            compactor::CompactorConfig {
                compaction_interval: config.compactor.compaction_interval,
                target_block_size: config.compactor.target_block_size,
                max_compaction_inputs: config.compactor.max_compaction_inputs,
                max_compaction_range: config.compactor.max_compaction_range,
                max_objects_per_block: config.compactor.max_objects_per_block,
                compacted_block_retention: config.compactor.compacted_block_retention,
                block_options: Default::default(),
            },
            Some((compactor_ring, config.server.instance_id.clone())),
            &metric_registry,
        ));

        manager.start_service("compactor", move |shutdown| async move {
            let heartbeat = {
                let lifecycler = Arc::clone(&compactor_lifecycler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { lifecycler.heartbeat_loop(shutdown).await })
            };
            compactor.run(shutdown).await;
            let _ = heartbeat.await;
            compactor_lifecycler.deregister().await;
            Ok(())
        });
    }

    manager.mark_ready();
    info!(?target, "tracedb started");

    let result = manager
        .wait(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    result.map_err(RunError::ServiceFailed)
}

fn build_store(
    config: &Config,
    combiner: Arc<dyn data_types::ObjectCombiner>,
) -> Result<TraceStore, RunError> {
    let base = match config.storage.backend {
        BackendKind::Memory => ObjectStoreBackend::memory(),
        BackendKind::Local => {
            std::fs::create_dir_all(&config.storage.local_path)?;
            ObjectStoreBackend::local(&config.storage.local_path)?
        }
        kind @ (BackendKind::S3 | BackendKind::Gcs | BackendKind::Azure) => {
            return Err(RunError::UnsupportedBackend { kind });
        }
    };
    let base = Arc::new(base);

    let mut reader: Arc<dyn RawReader> = Arc::clone(&base) as _;
    let writer: Arc<dyn RawWriter>;

    match config.storage.cache {
        CacheKind::None => {
            writer = base;
        }
        cache_kind => {
            if cache_kind != CacheKind::Memory {
                warn!(
                    ?cache_kind,
                    "external cache servers are wired through deployment tooling; using the in-process cache"
                );
            }
            let cached = Arc::new(CachingBackend::new(
                Arc::clone(&reader),
                Arc::clone(&base) as _,
                Arc::new(MemCache::new(config.storage.cache_max_entries.max(1))),
            ));
            reader = Arc::clone(&cached) as _;
            writer = cached;
        }
    }

    if let Some(hedge_at) = config.storage.hedge_requests_at {
        reader = Arc::new(HedgedReader::new(reader, hedge_at));
    }

    Ok(TraceStore::new(
        reader,
        writer,
        combiner,
        StoreConfig {
            blocklist_poll: config.storage.blocklist_poll,
            max_find_workers: config.storage.pool.max_workers,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_builds_with_cache_and_hedging() {
        let mut config = Config::default();
        config.storage.backend = BackendKind::Memory;
        config.storage.cache = CacheKind::Memory;
        config.storage.hedge_requests_at = Some(std::time::Duration::from_millis(500));

        build_store(&config, Arc::new(TraceCombiner)).unwrap();
    }

    #[test]
    fn cloud_backends_point_at_deployment_tooling() {
        let mut config = Config::default();
        config.storage.backend = BackendKind::S3;
        assert!(matches!(
            build_store(&config, Arc::new(TraceCombiner)),
            Err(RunError::UnsupportedBackend { .. })
        ));
    }
}
