//! Pre-warmed container pool.
//!
//! The pool amortizes container startup by keeping a small fleet of
//! long-running shell-host containers (`sleep infinity` as PID 1, hardened
//! like every sandbox container). Checkout is serialized through a single
//! bounded queue; containers are recycled after a configured number of
//! uses, reaped when idle too long and dropped when the runtime reports
//! them unhealthy. A background task drives the health/idle loop and is
//! joined on shutdown.

use crate::{
    config::PoolSettings,
    error::{CommandError, ErrorKind},
    runtime::{nano_cpus, parse_memory, Bind, ContainerRuntime, ContainerSpecBuilder},
    sandbox::{short_id, WORKSPACE},
};
use anyhow::{bail, Context, Result};
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Bounded wait for a returned container before reporting exhaustion.
const CHECKOUT_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone, CopyGetters, Debug, Getters)]
/// Metadata of one pooled container. The pool owns the slot; `get` hands a
/// loan of this value to the caller, `put` takes it back.
pub struct PooledContainer {
    #[get = "pub"]
    id: String,

    #[get = "pub"]
    image: String,

    #[get_copy = "pub"]
    use_count: u32,

    #[get_copy = "pub"]
    max_uses: u32,

    #[get_copy = "pub"]
    created_at: Instant,

    #[get_copy = "pub"]
    last_used: Instant,

    #[get_copy = "pub"]
    in_use: bool,

    #[get_copy = "pub"]
    healthy: bool,
}

/// Atomically consistent snapshot of pool state and counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub size: usize,
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub destroyed: u64,
}

#[derive(Default)]
struct PoolState {
    tracked: HashMap<String, PooledContainer>,
    /// Tracked containers plus creations in flight; never exceeds `size`.
    total: usize,
    closed: bool,
}

pub struct ContainerPool {
    runtime: Arc<dyn ContainerRuntime>,
    settings: PoolSettings,
    repo_root: PathBuf,
    state: RwLock<PoolState>,
    available_tx: mpsc::Sender<String>,
    available_rx: Mutex<mpsc::Receiver<String>>,
    checkout_wait: Duration,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl ContainerPool {
    /// Construct the pool, pre-warming the configured number of containers
    /// and starting the health/idle loop.
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: PoolSettings,
        repo_root: PathBuf,
    ) -> Result<Arc<Self>> {
        Self::with_checkout_wait(runtime, settings, repo_root, CHECKOUT_WAIT).await
    }

    async fn with_checkout_wait(
        runtime: Arc<dyn ContainerRuntime>,
        settings: PoolSettings,
        repo_root: PathBuf,
        checkout_wait: Duration,
    ) -> Result<Arc<Self>> {
        if settings.size() == 0 {
            return Err(CommandError::new(ErrorKind::PoolConfig, "pool size must be positive").into());
        }
        if settings.max_uses_per_container() == 0 {
            return Err(
                CommandError::new(ErrorKind::PoolConfig, "max uses per container must be positive")
                    .into(),
            );
        }
        if settings.image().is_empty() {
            return Err(CommandError::new(ErrorKind::PoolConfig, "pool image must be set").into());
        }

        let (available_tx, available_rx) = mpsc::channel(settings.size());
        let pool = Arc::new(Self {
            runtime,
            repo_root,
            state: RwLock::new(PoolState::default()),
            available_tx,
            available_rx: Mutex::new(available_rx),
            checkout_wait,
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            settings,
        });

        let prewarm = pool.settings.startup_containers().min(pool.settings.size());
        for _ in 0..prewarm {
            pool.create_idle().await.context("pre-warm pool container")?;
        }

        pool.spawn_health_task().await;
        Ok(pool)
    }

    /// Check a container out of the pool.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<PooledContainer> {
        loop {
            if self.state.read().await.closed {
                return Err(CommandError::new(ErrorKind::PoolClosed, "pool is closed").into());
            }

            // Fast path: take an idle container without blocking.
            let popped = { self.available_rx.lock().await.try_recv().ok() };
            if let Some(id) = popped {
                match self.checkout(&id).await {
                    Some(container) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(container);
                    }
                    None => continue,
                }
            }

            // Miss: create a new container while there is headroom.
            if let Some(container) = self.create_checked_out().await? {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(container);
            }

            // Full: wait for a returned container, bounded, cancellable.
            let waited = {
                let mut rx = self.available_rx.lock().await;
                tokio::select! {
                    id = rx.recv() => id,
                    _ = cancel.cancelled() => {
                        bail!("container checkout cancelled")
                    }
                    _ = self.shutdown.cancelled() => {
                        return Err(
                            CommandError::new(ErrorKind::PoolClosed, "pool is closed").into()
                        );
                    }
                    _ = tokio::time::sleep(self.checkout_wait) => {
                        return Err(CommandError::new(
                            ErrorKind::PoolExhausted,
                            format!(
                                "no container became available within {}s",
                                self.checkout_wait.as_secs()
                            ),
                        )
                        .into());
                    }
                }
            };

            match waited {
                Some(id) => {
                    if let Some(container) = self.checkout(&id).await {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(container);
                    }
                }
                None => {
                    return Err(CommandError::new(ErrorKind::PoolClosed, "pool is closed").into())
                }
            }
        }
    }

    /// Return a checked-out container to the pool, recycling it when it has
    /// reached its use limit or turned unhealthy.
    pub async fn put(&self, container: PooledContainer) -> Result<()> {
        let id = container.id;

        let mut state = self.state.write().await;
        if state.closed {
            if state.tracked.remove(&id).is_some() {
                state.total -= 1;
                drop(state);
                self.destroy(&id).await;
            }
            return Ok(());
        }

        let Some(entry) = state.tracked.get_mut(&id) else {
            bail!("returned container {} is not tracked by this pool", short_id(&id));
        };

        let recycle = entry.use_count >= entry.max_uses || !entry.healthy;
        if recycle {
            state.tracked.remove(&id);
            state.total -= 1;
            drop(state);

            debug!("Recycling pool container {}", short_id(&id));
            self.destroy(&id).await;
            if let Err(e) = self.create_idle().await {
                warn!("Unable to create replacement pool container: {:#}", e);
            }
        } else {
            entry.in_use = false;
            entry.last_used = Instant::now();
            drop(state);

            if self.available_tx.try_send(id).is_err() {
                warn!("Available queue rejected a returned container");
            }
        }

        Ok(())
    }

    /// Stop the pool: join the health task, drain the queue and destroy
    /// every tracked container. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.shutdown.cancel();
        if let Some(handle) = self.health_task.lock().await.take() {
            let _ = handle.await;
        }

        {
            let mut rx = self.available_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        let ids: Vec<String> = {
            let mut state = self.state.write().await;
            let ids = state.tracked.keys().cloned().collect();
            state.tracked.clear();
            state.total = 0;
            ids
        };
        for id in ids {
            self.destroy(&id).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        let in_use = state.tracked.values().filter(|c| c.in_use).count();
        PoolStats {
            size: self.settings.size(),
            total: state.total,
            in_use,
            idle: state.tracked.len() - in_use,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Mark the popped container as checked out, or drop it when it is
    /// stale, unhealthy or already over its use limit. Containers in those
    /// states are never handed to a caller.
    async fn checkout(&self, id: &str) -> Option<PooledContainer> {
        let mut state = self.state.write().await;
        let entry = state.tracked.get_mut(id)?;

        if !entry.healthy || entry.use_count >= entry.max_uses {
            state.tracked.remove(id);
            state.total -= 1;
            drop(state);
            self.destroy(id).await;
            return None;
        }

        entry.in_use = true;
        entry.use_count += 1;
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    /// Create a container directly in the checked-out state if the pool has
    /// headroom; `None` when it is full.
    async fn create_checked_out(&self) -> Result<Option<PooledContainer>> {
        if !self.reserve_slot().await? {
            return Ok(None);
        }

        match self.launch_container().await {
            Ok(mut container) => {
                container.in_use = true;
                container.use_count = 1;
                self.state
                    .write()
                    .await
                    .tracked
                    .insert(container.id.clone(), container.clone());
                Ok(Some(container))
            }
            Err(e) => {
                self.state.write().await.total -= 1;
                Err(e)
            }
        }
    }

    /// Create an idle container and place it on the available queue, if
    /// there is headroom.
    async fn create_idle(&self) -> Result<()> {
        if !self.reserve_slot().await? {
            return Ok(());
        }

        match self.launch_container().await {
            Ok(container) => {
                let id = container.id.clone();
                self.state
                    .write()
                    .await
                    .tracked
                    .insert(id.clone(), container);
                if self.available_tx.try_send(id).is_err() {
                    warn!("Available queue rejected a new container");
                }
                Ok(())
            }
            Err(e) => {
                self.state.write().await.total -= 1;
                Err(e)
            }
        }
    }

    async fn reserve_slot(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(CommandError::new(ErrorKind::PoolClosed, "pool is closed").into());
        }
        if state.total >= self.settings.size() {
            return Ok(false);
        }
        state.total += 1;
        Ok(true)
    }

    async fn launch_container(&self) -> Result<PooledContainer> {
        let spec = ContainerSpecBuilder::default()
            .image(self.settings.image().clone())
            .command(vec!["sleep".to_string(), "infinity".to_string()])
            .binds(vec![Bind::new(self.repo_root.clone(), WORKSPACE, true)])
            .memory_bytes(parse_memory(self.settings.memory()))
            .nano_cpus(nano_cpus(self.settings.cpus()))
            .build()
            .context("assemble pool container spec")?;

        let id = self
            .runtime
            .create_container(&spec)
            .await
            .context("create pool container")?;
        self.runtime
            .start_container(&id)
            .await
            .context("start pool container")?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!("Started pool container {}", short_id(&id));

        let now = Instant::now();
        Ok(PooledContainer {
            id,
            image: self.settings.image().clone(),
            use_count: 0,
            max_uses: self.settings.max_uses_per_container(),
            created_at: now,
            last_used: now,
            in_use: false,
            healthy: true,
        })
    }

    async fn destroy(&self, id: &str) {
        if let Err(e) = self.runtime.remove_container(id).await {
            warn!("Unable to remove pool container {}: {:#}", short_id(id), e);
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    async fn spawn_health_task(self: &Arc<Self>) {
        let interval = self.settings.health_check_interval();
        if interval.is_zero() {
            return;
        }

        let pool = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => pool.health_sweep().await,
                }
            }
        });

        *self.health_task.lock().await = Some(handle);
    }

    /// One pass of the health/idle loop over a snapshot of the tracked
    /// containers.
    async fn health_sweep(&self) {
        let idle_timeout = self.settings.idle_timeout();
        let snapshot: Vec<(String, Instant)> = {
            let state = self.state.read().await;
            state
                .tracked
                .values()
                .filter(|c| !c.in_use)
                .map(|c| (c.id.clone(), c.last_used))
                .collect()
        };

        for (id, last_used) in snapshot {
            if !idle_timeout.is_zero() && last_used.elapsed() > idle_timeout {
                let removed = {
                    let mut state = self.state.write().await;
                    match state.tracked.get(&id) {
                        Some(entry) if !entry.in_use => {
                            state.tracked.remove(&id);
                            state.total -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if removed {
                    debug!("Reaping idle pool container {}", short_id(&id));
                    self.destroy(&id).await;
                }
                continue;
            }

            match self.runtime.container_state(&id).await {
                Ok(state) if state.running && !state.restarting => {}
                _ => {
                    // The next checkout or return drops it.
                    let mut pool_state = self.state.write().await;
                    if let Some(entry) = pool_state.tracked.get_mut(&id) {
                        entry.healthy = false;
                    }
                }
            }
        }
    }
}
