//! Elastic pool of VUs serving arrival-rate executors.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use futures::future::join_all;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};

use crate::iteration::IterationRunner;

/// How an iteration start was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// An idle VU took it.
    Idle,
    /// A new VU was spawned for it.
    Grown,
    /// Every VU was busy and the pool is at `max`.
    Dropped,
}

/// A bounded set of VUs, each running iterations strictly one at a time.
///
/// `pre_allocated` VUs are spawned up front; more are spawned on demand up to
/// `max`. Starts are handed out as semaphore permits, one per iteration, and
/// `idle` counts VUs waiting for a permit minus the permits not yet taken.
pub struct WorkerPool<D> {
    runner: Arc<IterationRunner<D>>,
    max: usize,
    spawned: AtomicUsize,
    idle: Arc<AtomicUsize>,
    tokens: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Send + Sync + 'static> WorkerPool<D> {
    pub fn new(runner: Arc<IterationRunner<D>>, pre_allocated: usize, max: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let pool = Self {
            runner,
            max: max.max(pre_allocated),
            spawned: AtomicUsize::new(0),
            idle: Arc::new(AtomicUsize::new(0)),
            tokens: Arc::new(Semaphore::new(0)),
            shutdown,
            handles: Mutex::new(Vec::with_capacity(pre_allocated)),
        };
        tracing::debug!(
            "Spawning {pre_allocated} VUs for {}...",
            pool.runner.scenario()
        );
        for _ in 0..pre_allocated {
            pool.spawned.fetch_add(1, Ordering::AcqRel);
            pool.spawn_worker(false);
        }
        pool
    }

    /// Hands one iteration start to a VU without waiting.
    pub fn try_dispatch(&self) -> Dispatch {
        let claimed = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if claimed {
            self.tokens.add_permits(1);
            return Dispatch::Idle;
        }

        let grown = self
            .spawned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok();
        if grown {
            self.spawn_worker(true);
            return Dispatch::Grown;
        }
        Dispatch::Dropped
    }

    /// VUs spawned so far; never more than `max`.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    /// Stops handing out work, then waits for every VU to finish its current
    /// iteration. Starts already dispatched still run.
    pub async fn drain(&self) {
        self.shutdown.send_replace(true);
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for res in join_all(handles).await {
            if let Err(e) = res {
                tracing::error!("VU task of {} failed: {e}", self.runner.scenario());
            }
        }
    }

    fn spawn_worker(&self, busy: bool) {
        let vu = self.runner.run_context().allocate_vu();
        if !busy {
            // Counted before the task is polled so a start at t = 0 finds it
            self.idle.fetch_add(1, Ordering::AcqRel);
        }
        let handle = tokio::spawn(worker(
            vu,
            busy,
            self.runner.clone(),
            self.idle.clone(),
            self.tokens.clone(),
            self.shutdown.subscribe(),
        ));
        match self.handles.lock() {
            Ok(mut handles) => handles.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

async fn worker<D: Send + Sync + 'static>(
    vu: u64,
    mut busy: bool,
    runner: Arc<IterationRunner<D>>,
    idle: Arc<AtomicUsize>,
    tokens: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if busy {
            runner.run(vu).await;
            idle.fetch_add(1, Ordering::AcqRel);
        }
        tokio::select! {
            // Pending starts win over shutdown so none is lost while draining
            biased;
            permit = tokens.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        busy = true;
    }
    tracing::trace!("VU {vu} retired");
}
