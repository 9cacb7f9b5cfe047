//! Bounded background task execution.
//!
//! Everything the hub runs in the background — per-connection readers and
//! writers, the idle sweep, fan-out pushes — goes through one pool so that a
//! connection flood cannot spawn unbounded work. A slot is held from
//! submission until the task finishes; at capacity, `submit` refuses rather
//! than queues.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool saturated: all {0} slots in use")]
    Saturated(usize),
}

pub struct WorkerPool {
    slots: Arc<Slots>,
}

struct Slots {
    active: AtomicUsize,
    capacity: usize,
}

/// RAII slot: releases back to the pool when the task finishes.
struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Arc<WorkerPool> {
        Arc::new(WorkerPool {
            slots: Arc::new(Slots {
                active: AtomicUsize::new(0),
                capacity,
            }),
        })
    }

    /// Submits a task for background execution on the tokio runtime.
    /// Fails immediately when every slot is in use.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self
            .try_acquire()
            .ok_or(PoolError::Saturated(self.slots.capacity))?;
        tokio::spawn(async move {
            task.await;
            drop(guard);
        });
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.slots.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    fn try_acquire(&self) -> Option<SlotGuard> {
        loop {
            let current = self.slots.active.load(Ordering::SeqCst);
            if current >= self.slots.capacity {
                return None;
            }
            if self
                .slots
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(SlotGuard { slots: self.slots.clone() });
            }
            // Lost the race to another submitter; retry.
        }
    }
}
