//! Process-wide engine state, created once and shared by every processor.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backend::Backends;
use crate::backend::command::CommandBackend;
use crate::cache::ResultCache;
use crate::config::{Config, LoadedConfig};
use crate::custody::{CustodyRecorder, CustodySink, build_sink};
use crate::evidence::Modality;
use crate::executor::{CancelToken, Executor};
use crate::processor::EvidenceProcessor;

pub struct EngineContext {
    pub config: Config,
    pub config_hash: String,
    pub custody: Arc<CustodyRecorder>,
    pub cache: Arc<ResultCache>,
    pub executor: Executor,
    pub backends: Backends,
    shutdown: CancelToken,
}

impl EngineContext {
    pub fn new(loaded: LoadedConfig, sink: Box<dyn CustodySink>, backends: Backends) -> Arc<Self> {
        let LoadedConfig {
            config,
            config_hash,
        } = loaded;
        let executor = Executor::new(config.worker_count(), config.gpu_device.as_deref());
        let cache = Arc::new(ResultCache::new(config.cache_capacity, config.cache_ttl()));
        info!(
            "engine run_id={} config_hash={} cache_capacity={} cache_ttl_s={}",
            config.run_id, config_hash, config.cache_capacity, config.cache_ttl_seconds
        );
        Arc::new(Self {
            config,
            config_hash,
            custody: Arc::new(CustodyRecorder::new(sink)),
            cache,
            executor,
            backends,
            shutdown: CancelToken::new(),
        })
    }

    /// Build the custody sink and backends the config names.
    pub fn from_config(loaded: LoadedConfig) -> Result<Arc<Self>> {
        let cfg = &loaded.config;
        let sink = build_sink(
            cfg.custody.backend,
            &cfg.run_id,
            env!("CARGO_PKG_VERSION"),
            &loaded.config_hash,
            &cfg.custody.output_dir,
        )
        .with_context(|| {
            format!(
                "opening custody log in {}",
                cfg.custody.output_dir.display()
            )
        })?;

        let backends = match &cfg.backend_command {
            Some(program) => {
                info!("analysis backend command={}", program.display());
                Backends::command(CommandBackend::new(program).with_args(&cfg.backend_args))
            }
            None => {
                warn!("no backend_command configured; every analysis will report the backend as unavailable");
                Backends::unconfigured()
            }
        };

        Ok(Self::new(loaded, sink, backends))
    }

    pub fn processor(self: &Arc<Self>, modality: Modality) -> EvidenceProcessor {
        EvidenceProcessor::new(self.clone(), modality)
    }

    /// Parent of every request's cancel token.
    pub fn shutdown_token(&self) -> &CancelToken {
        &self.shutdown
    }

    pub fn cancel_all(&self) {
        warn!("cancelling all in-flight evidence processing");
        self.shutdown.cancel();
    }

    /// Drain the custody log. Recording after this point is counted as a
    /// persistence failure.
    pub fn shutdown(&self) {
        self.custody.flush();
        self.custody.shutdown();
        let stats = self.cache.stats();
        info!(
            "engine shutdown custody_failures={} cache_hits={} cache_misses={} cache_entries={}",
            self.custody.failure_count(),
            stats.hits,
            stats.misses,
            stats.entries
        );
    }
}
