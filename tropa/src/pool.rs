use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    runner::Runner,
    state::RunState,
};

/// Where a VU is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VuState {
    Idle,
    Running,
    Stopped,
}

/// A virtual user: runner-defined state plus bookkeeping.
///
/// A `Vu` is a plain owned value. Whoever holds it is its only user; handing it
/// to someone else means moving it.
#[derive(Debug)]
pub struct Vu<S> {
    id: u64,
    state: VuState,
    iterations: u64,
    pub(crate) data: S,
}

impl<S> Vu<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    /// Iterations this VU completed, over every executor it served.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub(crate) fn set_state(&mut self, state: VuState) {
        self.state = state;
    }

    pub(crate) fn iteration_done(&mut self) {
        self.iterations += 1;
    }
}

/// Reusable set of VUs shared by every executor of a run.
///
/// Capacity is a semaphore holding one permit per VU that is not checked out.
/// Idle VUs wait on a free list; VUs are created lazily (running the runner's
/// one-time setup) when the free list is empty and the pool is below its maximum.
pub struct VuPool<R: Runner> {
    runner: Arc<R>,
    state: Arc<RunState>,
    idle: Mutex<Vec<Vu<R::State>>>,
    slots: Semaphore,
    max: usize,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl<R: Runner> VuPool<R> {
    pub fn new(runner: Arc<R>, state: Arc<RunState>, max: usize) -> Self {
        Self {
            runner,
            state,
            idle: Mutex::new(Vec::with_capacity(max)),
            slots: Semaphore::new(max),
            max,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
        }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// VUs created so far.
    pub fn initialized(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// VUs sitting on the free list.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take a VU, waiting for one to be returned if the pool is at its maximum.
    ///
    /// Fails with [`Error::PoolExhausted`] if `cancel` fires while waiting and with
    /// [`Error::VuInit`] if a new VU could not be set up.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Vu<R::State>> {
        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!("All {} VUs are busy, waiting for one", self.max);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::PoolExhausted { max: self.max }),
                    permit = self.slots.acquire() => permit.map_err(|_| Error::PoolClosed)?,
                }
            }
        };
        self.checkout(permit).await
    }

    /// Take a VU only if one is available right now (idle or creatable).
    pub async fn try_get(&self) -> Result<Option<Vu<R::State>>> {
        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => return Ok(None),
        };
        self.checkout(permit).await.map(Some)
    }

    /// Turn a slot into a VU. The slot is only kept once the VU exists, so a
    /// failing or panicking setup frees it again.
    async fn checkout(&self, permit: SemaphorePermit<'_>) -> Result<Vu<R::State>> {
        let reused = self.idle.lock().pop();
        let vu = match reused {
            Some(vu) => vu,
            None => self.create().await?,
        };
        // The slot now belongs to the VU we hand out; `put` or `forfeit` gives it back.
        permit.forget();
        Ok(vu)
    }

    async fn create(&self) -> Result<Vu<R::State>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(vu = id, "Initializing VU");
        let data = self
            .runner
            .setup_vu(id)
            .await
            .map_err(|source| Error::VuInit { id, source })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        self.state.vu_initialized();
        Ok(Vu {
            id,
            state: VuState::Idle,
            iterations: 0,
            data,
        })
    }

    /// Return a VU and wake one waiter.
    pub fn put(&self, mut vu: Vu<R::State>) {
        vu.set_state(VuState::Idle);
        self.idle.lock().push(vu);
        self.slots.add_permits(1);
    }

    /// Free the slot of a checked-out VU that was lost with its holder, so a new VU
    /// can be created in its place.
    pub(crate) fn forfeit(&self, vu: u64) {
        tracing::warn!(vu, "VU lost with its task, freeing its slot");
        self.created.fetch_sub(1, Ordering::Relaxed);
        self.slots.add_permits(1);
    }

    /// Arm a [`SlotGuard`] for a checked-out VU.
    pub(crate) fn guard(self: &Arc<Self>, vu: &Vu<R::State>) -> SlotGuard<R> {
        SlotGuard {
            pool: self.clone(),
            vu: vu.id(),
            armed: true,
        }
    }

    /// Close the pool and tear down every idle VU. VUs still checked out are
    /// dropped by their holders without teardown.
    pub async fn dispose(&self) {
        self.slots.close();
        let vus = std::mem::take(&mut *self.idle.lock());
        let outstanding = self.initialized() as usize - vus.len();
        if outstanding > 0 {
            tracing::warn!("Disposing VU pool with {outstanding} VUs still checked out");
        }
        tracing::debug!("Tearing down {} VUs", vus.len());
        join_all(vus.into_iter().map(|mut vu| {
            vu.set_state(VuState::Stopped);
            self.runner.teardown_vu(vu.id, vu.data)
        }))
        .await;
    }
}

/// Forfeits a checked-out VU's slot if dropped while armed, which happens when the
/// task holding the VU unwinds. Disarm it once the VU is safely back in hand.
#[must_use]
pub(crate) struct SlotGuard<R: Runner> {
    pool: Arc<VuPool<R>>,
    vu: u64,
    armed: bool,
}

impl<R: Runner> SlotGuard<R> {
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R: Runner> Drop for SlotGuard<R> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forfeit(self.vu);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{error::BoxError, runner::IterationInfo, sample::SampleBatch};

    #[derive(Default)]
    struct CountingRunner {
        setups: AtomicUsize,
        teardowns: AtomicUsize,
        fail_setup: bool,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        type State = u64;

        async fn setup_vu(&self, vu: u64) -> Result<u64, BoxError> {
            if self.fail_setup {
                return Err("no browser available".into());
            }
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(vu * 10)
        }

        async fn run_iteration(
            &self,
            _state: &mut u64,
            _info: &IterationInfo,
        ) -> Result<SampleBatch, BoxError> {
            Ok(SampleBatch::new())
        }

        async fn teardown_vu(&self, _vu: u64, _state: u64) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize) -> Arc<VuPool<CountingRunner>> {
        Arc::new(VuPool::new(
            Arc::new(CountingRunner::default()),
            Arc::new(RunState::new()),
            max,
        ))
    }

    #[tokio::test]
    async fn reuses_returned_vus_and_sets_up_once() {
        let pool = pool(2);
        let cancel = CancellationToken::new();

        let a = pool.get(&cancel).await.unwrap();
        assert_eq!(a.data, a.id() * 10);
        let id = a.id();
        pool.put(a);
        let again = pool.get(&cancel).await.unwrap();

        assert_eq!(again.id(), id);
        assert_eq!(pool.runner().setups.load(Ordering::SeqCst), 1);
        assert_eq!(pool.initialized(), 1);
    }

    #[tokio::test]
    async fn get_waits_for_a_returned_vu_at_max() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let held = pool.get(&cancel).await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.get(&cancel).await.map(|vu| vu.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.put(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_is_pool_exhausted() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.get(&cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.get(&cancel).await.map(|vu| vu.id()) })
        };
        cancel.cancel();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(Error::PoolExhausted { max: 1 })));
        assert!(pool.try_get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_setup_releases_the_slot() {
        let pool = Arc::new(VuPool::new(
            Arc::new(CountingRunner {
                fail_setup: true,
                ..Default::default()
            }),
            Arc::new(RunState::new()),
            1,
        ));
        let cancel = CancellationToken::new();
        assert!(matches!(pool.get(&cancel).await, Err(Error::VuInit { .. })));
        assert!(matches!(pool.get(&cancel).await, Err(Error::VuInit { .. })));
    }

    #[tokio::test]
    async fn lost_vu_frees_its_slot() {
        let pool = pool(1);
        let cancel = CancellationToken::new();

        let vu = pool.get(&cancel).await.unwrap();
        let guard = pool.guard(&vu);
        drop(vu);
        assert!(pool.try_get().await.unwrap().is_none());
        drop(guard);

        let replacement = pool.try_get().await.unwrap().unwrap();
        assert_eq!(replacement.id(), 2);
        assert_eq!(pool.initialized(), 1);
        assert_eq!(pool.runner().setups.load(Ordering::SeqCst), 2);

        let kept = pool.guard(&replacement);
        kept.disarm();
        assert!(pool.try_get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispose_tears_down_idle_vus_and_closes() {
        let pool = pool(3);
        let cancel = CancellationToken::new();
        let a = pool.get(&cancel).await.unwrap();
        let b = pool.get(&cancel).await.unwrap();
        pool.put(a);
        pool.put(b);

        pool.dispose().await;
        assert_eq!(pool.runner().teardowns.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.get(&cancel).await, Err(Error::PoolClosed)));
    }
}
