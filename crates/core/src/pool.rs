//! Bounded worker pool
//!
//! A fixed number of permits gates task admission: a permit is acquired
//! (racing cancellation) before a task is dispatched, and the task releases
//! it when it finishes. Outcomes come back through `join_next` to the single
//! coordinator that owns the pool, which is the only writer of any aggregate.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Handle for acquiring dispatch permits, usable while the pool itself is
/// borrowed elsewhere (e.g. inside a `select!`)
#[derive(Clone)]
pub(crate) struct Admission {
    permits: Arc<Semaphore>,
}

impl Admission {
    /// Wait for a free slot, or fail with `Error::Cancelled`
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::InvalidState("worker pool closed".to_string()))
            }
        }
    }

    /// Whether a slot is free right now
    pub(crate) fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }
}

pub(crate) struct BoundedPool<T> {
    admission: Admission,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> BoundedPool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            admission: Admission {
                permits: Arc::new(Semaphore::new(capacity.max(1))),
            },
            tasks: JoinSet::new(),
        }
    }

    pub(crate) fn admission(&self) -> Admission {
        self.admission.clone()
    }

    /// Run `task` under an already-acquired permit
    ///
    /// The returned id comes back from the `*_with_id` joins, also when the
    /// task panicked, so callers can recover whatever the task was holding.
    pub(crate) fn dispatch<F>(&mut self, permit: OwnedSemaphorePermit, task: F) -> Id
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks
            .spawn(async move {
                let output = task.await;
                drop(permit);
                output
            })
            .id()
    }

    /// Acquire a permit and dispatch `task`
    ///
    /// Returns `Error::Cancelled` without starting the task when the token
    /// fires first.
    pub(crate) async fn spawn<F>(&mut self, cancel: &CancellationToken, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self.admission.acquire(cancel).await?;
        self.dispatch(permit, task);
        Ok(())
    }

    /// Next finished task, or `None` when nothing is running
    pub(crate) async fn join_next(&mut self) -> Option<Result<T>> {
        self.tasks
            .join_next()
            .await
            .map(|joined| joined.map_err(Error::from))
    }

    /// Finished outcome if one is ready, without waiting
    pub(crate) fn try_join_next(&mut self) -> Option<Result<T>> {
        self.tasks
            .try_join_next()
            .map(|joined| joined.map_err(Error::from))
    }

    /// Like [`join_next`](Self::join_next), tagged with the task id
    pub(crate) async fn join_next_with_id(&mut self) -> Option<(Id, Result<T>)> {
        self.tasks.join_next_with_id().await.map(split_joined)
    }

    /// Like [`try_join_next`](Self::try_join_next), tagged with the task id
    pub(crate) fn try_join_next_with_id(&mut self) -> Option<(Id, Result<T>)> {
        self.tasks.try_join_next_with_id().map(split_joined)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn split_joined<T>(joined: std::result::Result<(Id, T), JoinError>) -> (Id, Result<T>) {
    match joined {
        Ok((id, output)) => (id, Ok(output)),
        Err(e) => (e.id(), Err(Error::from(e))),
    }
}
