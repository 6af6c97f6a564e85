//! Wiring of the long-lived services shared by the server and the CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditSink, DEFAULT_AUDIT_CAPACITY};
use crate::capacity::CapacityGuard;
use crate::config::Config;
use crate::generation::{GenerationEngine, HttpProvider, Provider};
use crate::keypool::KeyPool;
use crate::orchestrator::{AdmissionController, Orchestrator};
use crate::queue::JobQueue;
use crate::store::{BuildDb, DbHandle};

pub struct Services {
    pub config: Config,
    pub db: DbHandle,
    pub keys: Arc<KeyPool>,
    pub orchestrator: Arc<Orchestrator>,
    pub admission: Arc<AdmissionController>,
    pub queue: Arc<JobQueue>,
    audit_task: Option<JoinHandle<()>>,
}

impl Services {
    /// Open the database named by the config and talk to the real provider.
    pub fn open(config: Config) -> Result<Self> {
        let db = open_database(&config)?;
        let provider = HttpProvider::new(
            config.provider.base_url.clone(),
            Duration::from_secs(config.provider.connect_timeout_secs.max(1)),
        )
        .context("Failed to build provider client")?;
        info!(db = %config.db_path().display(), provider = %config.provider.kind, "Services starting");
        Self::with_provider(config, db, Arc::new(provider))
    }

    /// Assemble everything over an open database and any provider.
    pub fn with_provider(config: Config, db: BuildDb, provider: Arc<dyn Provider>) -> Result<Self> {
        let db = DbHandle::new(db);
        seed_keys(&db, &config)?;

        let (audit, audit_task) = AuditSink::spawn(db.clone(), DEFAULT_AUDIT_CAPACITY);
        let keys = Arc::new(
            KeyPool::new(Arc::new(db.clone())).with_health_policy(
                config.provider.failure_threshold,
                Duration::from_secs(config.provider.health_cooldown_secs),
            ),
        );
        let capacity = CapacityGuard::new(
            Arc::new(db.clone()),
            config.plan_table(),
            config.store_timeout(),
        );
        let generation = GenerationEngine::new(provider, config.provider.max_tokens);
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            generation,
            keys.clone(),
            audit.clone(),
            config.orchestrator_settings(),
        ));
        let admission = Arc::new(AdmissionController::new(
            db.clone(),
            capacity,
            keys.clone(),
            audit,
            config.admission_defaults(),
        ));
        let queue = Arc::new(JobQueue::new(db.clone(), config.queue.clone()));

        Ok(Self {
            config,
            db,
            keys,
            orchestrator,
            admission,
            queue,
            audit_task: Some(audit_task),
        })
    }

    /// Drop the service handles and give the audit writer a moment to
    /// drain. Entries still queued after that are lost.
    pub async fn close(mut self) {
        let task = self.audit_task.take();
        drop(self);
        if let Some(task) = task
            && tokio::time::timeout(Duration::from_secs(2), task).await.is_err()
        {
            warn!("Audit writer did not drain before shutdown");
        }
    }
}

/// Open (and create if needed) the database file named by the config.
pub fn open_database(config: &Config) -> Result<BuildDb> {
    let path = config.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    BuildDb::new(&path)
}

fn seed_keys(db: &DbHandle, config: &Config) -> Result<()> {
    if config.seed_keys.is_empty() {
        return Ok(());
    }
    let store = db.lock_sync()?;
    for secret in &config.seed_keys {
        let key = store.add_provider_key(config.provider.kind, secret)?;
        info!(provider = %key.provider, key = %key.fingerprint(), "Seeded provider key");
    }
    Ok(())
}
