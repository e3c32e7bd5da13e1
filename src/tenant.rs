use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::config::{Config, EngineConfig};
use crate::engine::Engine;

/// Manages per-organization engines. Each organization gets its own Engine,
/// WAL and compactor. Organization = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    max_tenants: usize,
    max_tenant_name_len: usize,
    engine_config: EngineConfig,
}

impl TenantManager {
    pub fn new(config: &Config) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir: config.data_dir.clone(),
            compact_threshold: config.compact_threshold,
            max_tenants: config.max_tenants,
            max_tenant_name_len: config.max_tenant_name_len,
            engine_config: config.engine.clone(),
        }
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > self.max_tenant_name_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal. Names that sanitize
        // to the same string share one engine, since they share one WAL file.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= self.max_tenants {
            return Err(std::io::Error::other("too many tenants"));
        }

        // The entry guard keeps two first connections from opening the same WAL twice.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.engine_config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("organization {safe_name} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
