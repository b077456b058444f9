// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker pool: the live worker set, the free list, and the claimer
//! queue.
//!
//! The pool enforces the maximum worker count. Compatibility between a
//! worker's hash and a group's hash is enforced by the orchestrator at claim
//! time; the pool hands out whatever is free.
//!
//! Claimers suspend on one-shot resume handles. Whoever frees capacity — a
//! job releasing its worker, or the exit of a stopped worker — resumes the
//! first claimer still listening; the claimer then retries its synchronous
//! claim. The claim decision is always taken before any suspension point, so
//! a concurrently freed worker cannot be lost.

use super::worker::WorkerHandle;
use crate::{config::DispatcherConfig, errors::DispatchError};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::debug;

#[derive(Debug)]
pub(super) struct WorkerPool {
    max_workers: usize,
    // Per-pool counter, so multiple dispatchers in one process don't
    // interfere.
    next_index: Cell<u32>,
    workers: RefCell<Vec<Rc<WorkerHandle>>>,
    free: RefCell<Vec<Rc<WorkerHandle>>>,
    claimers: RefCell<VecDeque<oneshot::Sender<()>>>,
    exit_tx: UnboundedSender<u32>,
    exit_rx: RefCell<UnboundedReceiver<u32>>,
}

impl WorkerPool {
    pub(super) fn new(max_workers: usize) -> Self {
        let (exit_tx, exit_rx) = unbounded_channel();
        Self {
            max_workers,
            next_index: Cell::new(0),
            workers: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            claimers: RefCell::new(VecDeque::new()),
            exit_tx,
            exit_rx: RefCell::new(exit_rx),
        }
    }

    /// The number of live workers, stopped-but-not-yet-exited included.
    pub(super) fn worker_count(&self) -> usize {
        self.workers.borrow().len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.workers.borrow().is_empty()
    }

    /// Pops a free worker, if any.
    pub(super) fn claim_free(&self) -> Option<Rc<WorkerHandle>> {
        self.free.borrow_mut().pop()
    }

    pub(super) fn has_capacity(&self) -> bool {
        self.worker_count() < self.max_workers
    }

    /// Spawns and registers a new worker. The worker counts against the
    /// maximum from this point, before its init handshake completes.
    pub(super) fn create_worker(
        &self,
        config: &DispatcherConfig,
    ) -> Result<Rc<WorkerHandle>, DispatchError> {
        let index = self.next_index.get();
        self.next_index.set(index + 1);
        let worker = WorkerHandle::spawn(
            &config.worker_command,
            index,
            config.forward_worker_stderr,
            self.exit_tx.clone(),
        )
        .map_err(|error| DispatchError::WorkerSpawn { index, error })?;
        self.workers.borrow_mut().push(worker.clone());
        Ok(worker)
    }

    /// Suspends until a worker frees or pool capacity opens up.
    pub(super) async fn wait_for_claim(&self) {
        let (tx, rx) = oneshot::channel();
        self.claimers.borrow_mut().push_back(tx);
        // An error means the resumer gave up on us, which cannot happen: the
        // sender is either consumed by a successful resume or dropped with
        // the pool.
        let _ = rx.await;
    }

    /// Returns a worker to the free list and resumes a claimer.
    pub(super) fn release(&self, worker: Rc<WorkerHandle>) {
        debug!(worker = worker.index(), "returning worker to the free list");
        self.free.borrow_mut().push(worker);
        self.resume_one_claimer();
    }

    /// Removes an exited worker from the pool and resumes a claimer, giving
    /// the next requester the chance to create a fresh worker.
    pub(super) fn handle_exit(&self, index: u32) {
        self.workers
            .borrow_mut()
            .retain(|worker| worker.index() != index);
        self.free
            .borrow_mut()
            .retain(|worker| worker.index() != index);
        debug!(
            worker = index,
            remaining = self.worker_count(),
            "removed exited worker from the pool"
        );
        self.resume_one_claimer();
    }

    /// The next exit notification. Pending while no worker has exited.
    pub(super) async fn next_exit(&self) -> Option<u32> {
        std::future::poll_fn(|cx| self.exit_rx.borrow_mut().poll_recv(cx)).await
    }

    /// Sends a stop to every live worker.
    pub(super) fn stop_all(&self) {
        for worker in self.workers.borrow().iter() {
            worker.stop();
        }
    }

    fn resume_one_claimer(&self) {
        let mut claimers = self.claimers.borrow_mut();
        // Abandoned claim futures leave dead senders behind; skip them.
        while let Some(claimer) = claimers.pop_front() {
            if claimer.send(()).is_ok() {
                break;
            }
        }
    }
}
