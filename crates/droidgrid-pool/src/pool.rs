//! Emulator pool — pre-warmed instances behind acquire/release.
//!
//! All five mutating operations serialize on one mutex over the pool
//! sets. Engine I/O never happens under the lock: capacity is reserved
//! first (the `pending` counter), the instance is created unlocked, and
//! the reservation is committed or rolled back afterwards. That keeps
//! `available + allocated + pending ≤ max_emulators` true at every
//! observable instant, even with concurrent acquires racing a scale-down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use droidgrid_core::{
    EmulatorError, EmulatorId, EmulatorInfo, EmulatorResult, FleetConfig, PoolStatus,
};
use droidgrid_manager::EmulatorManager;

struct PoolState {
    /// Idle instances, oldest first; acquire pops the head so no
    /// pre-warmed instance idles forever.
    available: VecDeque<EmulatorId>,
    /// Lease id → emulator id.
    allocated: HashMap<String, EmulatorId>,
    /// Capacity reserved for creates currently in flight.
    pending: usize,
}

/// Pre-warmed emulator allocation pool.
#[derive(Clone)]
pub struct EmulatorPool {
    manager: Arc<EmulatorManager>,
    config: FleetConfig,
    state: Arc<Mutex<PoolState>>,
    /// Single permit: at most one replenish task in flight, no matter
    /// how many acquires fire one off.
    replenish_gate: Arc<Semaphore>,
}

impl EmulatorPool {
    pub fn new(manager: Arc<EmulatorManager>, config: FleetConfig) -> Self {
        Self {
            manager,
            config,
            state: Arc::new(Mutex::new(PoolState {
                available: VecDeque::new(),
                allocated: HashMap::new(),
                pending: 0,
            })),
            replenish_gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Create and start the pre-warm baseline, synchronously.
    ///
    /// The pool is not ready for acquires until this returns.
    pub async fn initialize(&self) -> EmulatorResult<()> {
        for _ in 0..self.config.pre_warm_count {
            let id = self.create_and_start().await?;
            self.state.lock().await.available.push_back(id);
        }
        info!(
            pre_warmed = self.config.pre_warm_count,
            max = self.config.max_emulators,
            "emulator pool initialized"
        );
        Ok(())
    }

    /// Lease the oldest available instance.
    ///
    /// Returns `Ok(None)` when the pool is empty: ordinary backpressure
    /// the caller must handle, not an error. A successful acquire kicks
    /// off a background replenish whose outcome never surfaces here.
    pub async fn acquire(&self, lease_id: &str) -> EmulatorResult<Option<EmulatorInfo>> {
        let emulator_id = {
            let mut state = self.state.lock().await;
            if state.allocated.contains_key(lease_id) {
                return Err(EmulatorError::Validation(format!(
                    "lease {lease_id} is already active"
                )));
            }
            match state.available.pop_front() {
                Some(id) => {
                    state.allocated.insert(lease_id.to_string(), id.clone());
                    id
                }
                None => {
                    debug!(%lease_id, "no emulator available");
                    return Ok(None);
                }
            }
        };

        self.trigger_replenish();

        match self.manager.get_info(&emulator_id).await {
            Some(info) => {
                debug!(%lease_id, id = %emulator_id, "emulator leased");
                Ok(Some(info))
            }
            None => {
                // Record vanished between pop and lookup; drop the lease
                // rather than hand out a ghost.
                warn!(%lease_id, id = %emulator_id, "leased emulator has no record");
                self.state.lock().await.allocated.remove(lease_id);
                Ok(None)
            }
        }
    }

    /// Return a leased instance to the pool, as-is.
    ///
    /// No restart, reset, or health check happens here; a dirtied
    /// instance is the health monitor's to catch on its own schedule.
    pub async fn release(&self, lease_id: &str) -> EmulatorResult<()> {
        let mut state = self.state.lock().await;
        let Some(id) = state.allocated.remove(lease_id) else {
            return Err(EmulatorError::NotFound(format!("lease {lease_id}")));
        };
        state.available.push_back(id.clone());
        debug!(%lease_id, %id, "emulator released");
        Ok(())
    }

    /// Create up to `count` additional instances, bounded by the cap.
    /// Returns how many were actually created.
    pub async fn scale_up(&self, count: usize) -> EmulatorResult<usize> {
        let mut created = 0;
        for _ in 0..count {
            if !self.reserve_below_max().await {
                break;
            }
            match self.create_and_start().await {
                Ok(id) => {
                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                    state.available.push_back(id);
                    created += 1;
                }
                Err(e) => {
                    self.state.lock().await.pending -= 1;
                    return Err(e);
                }
            }
        }
        info!(requested = count, created, "pool scaled up");
        Ok(created)
    }

    /// Destroy up to `count` idle instances. Leased instances are never
    /// touched, so an in-use lease cannot be yanked from its caller.
    /// Returns how many were destroyed.
    pub async fn scale_down(&self, count: usize) -> EmulatorResult<usize> {
        let victims: Vec<EmulatorId> = {
            let mut state = self.state.lock().await;
            let n = count.min(state.available.len());
            (0..n).filter_map(|_| state.available.pop_back()).collect()
        };

        let mut destroyed = 0;
        for id in victims {
            match self.manager.destroy(&id).await {
                Ok(()) => destroyed += 1,
                Err(e) => warn!(%id, error = %e, "scale-down destroy failed"),
            }
        }
        info!(requested = count, destroyed, "pool scaled down");
        Ok(destroyed)
    }

    /// Point-in-time counters. Pure read; in-flight creates are not
    /// counted until they materialize.
    pub async fn get_status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            available: state.available.len(),
            allocated: state.allocated.len(),
            total: state.available.len() + state.allocated.len(),
            max: self.config.max_emulators,
        }
    }

    /// Destroy every instance the pool owns, leased ones included.
    pub async fn shutdown(&self) {
        let ids: Vec<EmulatorId> = {
            let mut state = self.state.lock().await;
            let allocated: Vec<EmulatorId> = state.allocated.drain().map(|(_, id)| id).collect();
            state.available.drain(..).chain(allocated).collect()
        };

        for id in &ids {
            if let Err(e) = self.manager.destroy(id).await {
                warn!(%id, error = %e, "shutdown destroy failed");
            }
        }
        info!(destroyed = ids.len(), "emulator pool shut down");
    }

    /// Reserve one slot of capacity if the cap allows it.
    async fn reserve_below_max(&self) -> bool {
        let mut state = self.state.lock().await;
        let total = state.available.len() + state.allocated.len();
        if total + state.pending >= self.config.max_emulators {
            return false;
        }
        state.pending += 1;
        true
    }

    /// Fire-and-forget top-up toward the pre-warm baseline. The single
    /// semaphore permit dedupes concurrent triggers.
    fn trigger_replenish(&self) {
        if let Ok(permit) = self.replenish_gate.clone().try_acquire_owned() {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.replenish().await;
                drop(permit);
            });
        }
    }

    /// Converge `available` toward `pre_warm_count` without exceeding
    /// `max_emulators`. Safe to call repeatedly.
    async fn replenish(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                let total = state.available.len() + state.allocated.len();
                if state.available.len() + state.pending >= self.config.pre_warm_count
                    || total + state.pending >= self.config.max_emulators
                {
                    break;
                }
                state.pending += 1;
            }

            match self.create_and_start().await {
                Ok(id) => {
                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                    state.available.push_back(id);
                    debug!("pool replenished by one");
                }
                Err(e) => {
                    self.state.lock().await.pending -= 1;
                    warn!(error = %e, "pool replenish failed");
                    break;
                }
            }
        }
    }

    async fn create_and_start(&self) -> EmulatorResult<EmulatorId> {
        let info = self.manager.create(None, None).await?;
        if let Err(e) = self.manager.start(&info.id).await {
            warn!(id = %info.id, error = %e, "start failed, discarding instance");
            if let Err(destroy_err) = self.manager.destroy(&info.id).await {
                warn!(id = %info.id, error = %destroy_err, "cleanup destroy failed");
            }
            return Err(e);
        }
        Ok(info.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::RwLock;

    use droidgrid_core::{
        EmulatorConfig, EmulatorResult, EmulatorState, SnapshotInfo, epoch_secs,
    };
    use droidgrid_provider::EmulatorProvider;

    /// In-memory provider that fabricates instantly-running instances.
    #[derive(Default)]
    struct FakeProvider {
        instances: RwLock<HashMap<String, EmulatorInfo>>,
    }

    #[async_trait]
    impl EmulatorProvider for FakeProvider {
        async fn create(&self, config: &EmulatorConfig) -> EmulatorResult<EmulatorInfo> {
            let info = EmulatorInfo {
                id: config.id.clone(),
                config: config.clone(),
                state: EmulatorState::Creating,
                container_id: Some(format!("ctr-{}", config.id)),
                adb_address: Some(format!("127.0.0.1:{}", config.adb_port)),
                ip_address: None,
                created_at: epoch_secs(),
                metrics: None,
            };
            self.instances
                .write()
                .await
                .insert(config.id.clone(), info.clone());
            Ok(info)
        }

        async fn start(&self, id: &str) -> EmulatorResult<()> {
            let mut instances = self.instances.write().await;
            let info = instances
                .get_mut(id)
                .ok_or_else(|| EmulatorError::NotFound(id.to_string()))?;
            info.state = EmulatorState::Running;
            Ok(())
        }

        async fn stop(&self, id: &str) -> EmulatorResult<()> {
            let mut instances = self.instances.write().await;
            let info = instances
                .get_mut(id)
                .ok_or_else(|| EmulatorError::NotFound(id.to_string()))?;
            info.state = EmulatorState::Stopped;
            Ok(())
        }

        async fn destroy(&self, id: &str) -> EmulatorResult<()> {
            self.instances
                .write()
                .await
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| EmulatorError::NotFound(id.to_string()))
        }

        async fn get_state(&self, id: &str) -> EmulatorResult<EmulatorState> {
            self.instances
                .read()
                .await
                .get(id)
                .map(|info| info.state)
                .ok_or_else(|| EmulatorError::NotFound(id.to_string()))
        }

        async fn get_info(&self, id: &str) -> Option<EmulatorInfo> {
            self.instances.read().await.get(id).cloned()
        }

        async fn list_all(&self) -> Vec<EmulatorInfo> {
            self.instances.read().await.values().cloned().collect()
        }

        async fn snapshot(&self, id: &str, name: &str) -> EmulatorResult<SnapshotInfo> {
            Ok(SnapshotInfo {
                id: format!("sha256:{name}"),
                emulator_id: id.to_string(),
                name: name.to_string(),
                created_at: epoch_secs(),
                size_mb: 0,
            })
        }

        async fn restore_snapshot(&self, _id: &str, _snapshot_id: &str) -> EmulatorResult<()> {
            Err(EmulatorError::Unsupported("restore".to_string()))
        }

        async fn get_container_ip(&self, _container_id: &str) -> EmulatorResult<String> {
            Ok("172.17.0.2".to_string())
        }
    }

    fn pool_with(max: usize, pre_warm: usize) -> (EmulatorPool, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::default());
        let config = FleetConfig {
            max_emulators: max,
            pre_warm_count: pre_warm,
            adb_port_start: 5600,
            adb_port_end: 5855,
            ..Default::default()
        };
        let manager = Arc::new(EmulatorManager::new(provider.clone(), config.clone()));
        (EmulatorPool::new(manager, config), provider)
    }

    /// Poll the status until `predicate` holds or a second passes.
    async fn wait_for_status<F>(pool: &EmulatorPool, predicate: F) -> PoolStatus
    where
        F: Fn(&PoolStatus) -> bool,
    {
        for _ in 0..100 {
            let status = pool.get_status().await;
            if predicate(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.get_status().await
    }

    #[tokio::test]
    async fn initialize_pre_warms_the_baseline() {
        let (pool, provider) = pool_with(5, 2);
        pool.initialize().await.unwrap();

        let status = pool.get_status().await;
        assert_eq!(
            status,
            PoolStatus {
                available: 2,
                allocated: 0,
                total: 2,
                max: 5
            }
        );
        // Pre-warmed instances are started, not just created.
        for info in provider.list_all().await {
            assert_eq!(info.state, EmulatorState::Running);
        }
    }

    #[tokio::test]
    async fn acquire_leases_and_replenish_restores_baseline() {
        let (pool, _) = pool_with(5, 2);
        pool.initialize().await.unwrap();

        let info = pool.acquire("lease-1").await.unwrap().unwrap();
        assert!(!info.id.is_empty());

        let status = pool.get_status().await;
        assert_eq!(status.allocated, 1);
        // The background replenish may or may not have landed yet.
        assert!(status.available == 1 || status.available == 2);

        let status = wait_for_status(&pool, |s| s.available == 2).await;
        assert_eq!(
            status,
            PoolStatus {
                available: 2,
                allocated: 1,
                total: 3,
                max: 5
            }
        );
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_is_backpressure_not_error() {
        let (pool, _) = pool_with(5, 0);
        pool.initialize().await.unwrap();
        assert!(pool.acquire("lease-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_lease_id_is_rejected() {
        let (pool, _) = pool_with(5, 2);
        pool.initialize().await.unwrap();

        pool.acquire("lease-1").await.unwrap().unwrap();
        let err = pool.acquire("lease-1").await.unwrap_err();
        assert!(matches!(err, EmulatorError::Validation(_)));
    }

    #[tokio::test]
    async fn release_returns_instance_without_destroying_it() {
        let (pool, provider) = pool_with(5, 1);
        pool.initialize().await.unwrap();

        let info = pool.acquire("lease-1").await.unwrap().unwrap();
        pool.release("lease-1").await.unwrap();

        let status = pool.get_status().await;
        assert_eq!(status.allocated, 0);
        assert!(status.available >= 1);
        // Still registered and still running: reuse is as-is.
        let live = provider.get_info(&info.id).await.unwrap();
        assert_eq!(live.state, EmulatorState::Running);
    }

    #[tokio::test]
    async fn release_of_unknown_lease_fails() {
        let (pool, _) = pool_with(5, 1);
        pool.initialize().await.unwrap();
        let err = pool.release("lease-ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fifo_reuse_hands_back_the_same_instance() {
        let (pool, _) = pool_with(1, 1);
        pool.initialize().await.unwrap();

        let first = pool.acquire("lease-1").await.unwrap().unwrap();
        pool.release("lease-1").await.unwrap();
        let second = pool.acquire("lease-2").await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_an_instance() {
        // max == pre_warm so replenish cannot add instances mid-test.
        let (pool, _) = pool_with(8, 8);
        pool.initialize().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire(&format!("lease-{i}")).await.unwrap()
            }));
        }

        let mut granted = HashSet::new();
        let mut misses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Some(info) => {
                    assert!(granted.insert(info.id.clone()), "{} leased twice", info.id);
                }
                None => misses += 1,
            }
        }
        assert_eq!(granted.len(), 8);
        assert_eq!(misses, 8);
    }

    #[tokio::test]
    async fn scale_up_is_capped_at_max() {
        let (pool, _) = pool_with(5, 2);
        pool.initialize().await.unwrap();

        let created = pool.scale_up(100).await.unwrap();
        assert_eq!(created, 3);

        let status = pool.get_status().await;
        assert_eq!(status.total, 5);
        assert_eq!(status.available, 5);
    }

    #[tokio::test]
    async fn scale_down_spares_allocated_instances() {
        let (pool, provider) = pool_with(5, 3);
        pool.initialize().await.unwrap();

        let leased = pool.acquire("lease-1").await.unwrap().unwrap();
        // Let the background replenish converge before scaling down.
        let status = wait_for_status(&pool, |s| s.available == 3).await;
        assert_eq!(status.allocated, 1);

        let destroyed = pool.scale_down(10).await.unwrap();
        assert_eq!(destroyed, 3);

        let status = pool.get_status().await;
        assert_eq!(status.available, 0);
        assert_eq!(status.allocated, 1);
        // The leased instance survived.
        assert!(provider.get_info(&leased.id).await.is_some());
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_under_replenish_pressure() {
        let (pool, _) = pool_with(3, 2);
        pool.initialize().await.unwrap();

        pool.acquire("lease-1").await.unwrap().unwrap();
        pool.acquire("lease-2").await.unwrap().unwrap();

        // Replenish converges: 2 allocated + 1 available == max of 3.
        let status = wait_for_status(&pool, |s| s.available == 1).await;
        assert_eq!(
            status,
            PoolStatus {
                available: 1,
                allocated: 2,
                total: 3,
                max: 3
            }
        );

        // And it stops there: no further growth past the cap.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.get_status().await.total, 3);
    }

    #[tokio::test]
    async fn shutdown_destroys_everything() {
        let (pool, provider) = pool_with(5, 3);
        pool.initialize().await.unwrap();
        pool.acquire("lease-1").await.unwrap().unwrap();
        // Wait out the replenish so no create is in flight during teardown.
        wait_for_status(&pool, |s| s.available == 3).await;

        pool.shutdown().await;

        let status = pool.get_status().await;
        assert_eq!(status.total, 0);
        assert!(provider.list_all().await.is_empty());
    }
}
