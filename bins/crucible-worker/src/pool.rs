/// Sandbox Pool Manager
///
/// **Core Responsibility:**
/// Keep `pool_size` started, idle, hardened containers per language so a
/// submission never waits on a cold start in the common case.
///
/// **Ownership Rules:**
/// - Idle containers belong to the pool
/// - `acquire` moves one container out; the caller owns it exclusively
/// - Containers never come back: the caller demolishes it, and a background
///   top-up task brings the idle set back to `pool_size`
/// - An empty pool is not an error: a one-off spike container with the same
///   hardened spec is created on the spot
///
/// Pool-level failures (pull, create, remove) are logged and never surfaced
/// to a job. A failed refill leaves the pool short until the next acquire
/// tops it back up to `pool_size`.

use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::sandbox::SandboxProfile;
use crucible_common::languages::LanguageConfigManager;
use crucible_common::types::Language;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Warm,
    Spike,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Warm => f.write_str("warm"),
            Origin::Spike => f.write_str("spike"),
        }
    }
}

/// A started sandbox. Deliberately not `Clone`: exactly one owner at a time.
#[derive(Debug, PartialEq, Eq)]
pub struct SandboxContainer {
    /// Unique container name, e.g. `warm-python-<uuid>`.
    pub name: String,
    /// Runtime handle (Docker container id).
    pub id: String,
    pub language: Language,
    pub origin: Origin,
}

#[derive(Debug, Default)]
struct LanguagePool {
    idle: Vec<SandboxContainer>,
    /// Refills claimed but not finished; counted toward the target.
    refilling: usize,
}

pub struct PoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    languages: LanguageConfigManager,
    profile: SandboxProfile,
    pool_size: usize,
    pools: Mutex<HashMap<Language, LanguagePool>>,
    replenishers: TaskTracker,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        languages: LanguageConfigManager,
        profile: SandboxProfile,
        pool_size: usize,
    ) -> Self {
        Self {
            runtime,
            languages,
            profile,
            pool_size,
            pools: Mutex::new(HashMap::new()),
            replenishers: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Sweep leftovers from a previous run, then warm every configured language.
    pub async fn initialize(&self) {
        info!(pool_size = self.pool_size, "Initializing hardened container pools");
        self.reap_orphans().await;

        join_all(self.languages.languages().map(|language| self.warm(language))).await;

        info!(pools = ?self.idle_counts(), "Container pools ready");
    }

    async fn warm(&self, language: Language) {
        let Some(config) = self.languages.get(language) else {
            return;
        };

        if let Err(e) = self.runtime.ensure_image(&config.image).await {
            // The pool stays empty; every submission for this language gets a spike container
            error!(language = %language, image = %config.image, error = %e, "Image pull failed, pool disabled");
            return;
        }

        for _ in 0..self.claim_refills(language) {
            self.refill_one(language).await;
        }
    }

    async fn reap_orphans(&self) {
        match self.runtime.list_sandboxes().await {
            Ok(ids) => {
                if !ids.is_empty() {
                    warn!(count = ids.len(), "Removing sandboxes left by a previous run");
                }
                join_all(ids.iter().map(|id| self.remove_quietly(id))).await;
            }
            Err(e) => warn!(error = %e, "Could not list leftover sandboxes"),
        }
    }

    async fn create(&self, language: Language, origin: Origin) -> Result<SandboxContainer, RuntimeError> {
        let config = self.languages.get(language).ok_or_else(|| RuntimeError::ContainerCreate {
            name: format!("{}-{}", origin, language),
            reason: "language is not configured".to_string(),
        })?;

        let name = format!("{}-{}-{}", origin, language, uuid::Uuid::new_v4());
        let spec = self.profile.spec_for(&config.image, language.as_str());
        let id = self.runtime.create_sandbox(&name, &spec).await?;

        Ok(SandboxContainer {
            name,
            id,
            language,
            origin,
        })
    }

    /// Reserve refills for whatever the pool is short of `pool_size`.
    ///
    /// Idle and in-progress refills are counted under the same lock, so
    /// concurrent top-ups never overshoot.
    fn claim_refills(&self, language: Language) -> usize {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let pool = pools.entry(language).or_default();
        let missing = self
            .pool_size
            .saturating_sub(pool.idle.len() + pool.refilling);
        pool.refilling += missing;
        missing
    }

    /// Start background refills until the pool is back at `pool_size`.
    fn top_up(self: &Arc<Self>, language: Language) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.claim_refills(language) {
            let pool = Arc::clone(self);
            self.replenishers.spawn(async move { pool.refill_one(language).await });
        }
    }

    /// Create one warm container for a claimed refill and add it to the idle set.
    async fn refill_one(&self, language: Language) {
        let created = self.create(language, Origin::Warm).await;

        let leftover = {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            let pool = pools.entry(language).or_default();
            pool.refilling = pool.refilling.saturating_sub(1);

            match created {
                Err(e) => {
                    // The next acquire for this language claims the slot again
                    error!(language = %language, error = %e, "Failed to replenish pool");
                    None
                }
                Ok(container) if self.closed.load(Ordering::SeqCst) => Some(container),
                Ok(container) => {
                    pool.idle.push(container);
                    debug!(language = %language, ready = pool.idle.len(), "Replenished pool");
                    None
                }
            }
        };

        // Shut down while it was being created
        if let Some(container) = leftover {
            self.demolish(container).await;
        }
    }

    /// Hand out a container for `language`.
    ///
    /// Pops from the idle set under the lock, so two callers can never get the
    /// same container. Either way the pool is topped up in the background,
    /// which also recovers slots lost to earlier failed refills.
    pub async fn acquire(self: &Arc<Self>, language: Language) -> Result<SandboxContainer, RuntimeError> {
        let popped = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&language)
            .and_then(|pool| pool.idle.pop());

        self.top_up(language);

        if let Some(container) = popped {
            debug!(language = %language, container = %container.name, "Acquired warm container");
            return Ok(container);
        }

        let container = self.create(language, Origin::Spike).await?;
        info!(language = %language, container = %container.name, "Pool empty, created spike container");
        Ok(container)
    }

    /// Force-remove a container. Failures are logged, never returned.
    pub async fn demolish(&self, container: SandboxContainer) {
        match self.runtime.remove(&container.id).await {
            Ok(()) => debug!(container = %container.name, "Demolished container"),
            Err(e) => error!(container = %container.name, error = %e, "Demolish failed"),
        }
    }

    async fn remove_quietly(&self, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
    }

    /// Stop refilling, wait for in-flight refills, and remove every idle container.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.replenishers.close();
        self.replenishers.wait().await;

        let drained: Vec<SandboxContainer> = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, pool)| pool.idle)
            .collect();

        info!(count = drained.len(), "Demolishing idle containers");
        join_all(drained.into_iter().map(|container| self.demolish(container))).await;
    }

    pub fn idle_count(&self, language: Language) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&language)
            .map_or(0, |pool| pool.idle.len())
    }

    pub fn idle_counts(&self) -> BTreeMap<String, usize> {
        self.languages
            .languages()
            .map(|language| (language.to_string(), self.idle_count(language)))
            .collect()
    }
}
