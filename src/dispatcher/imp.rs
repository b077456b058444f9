// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatcher orchestrator.
//!
//! [`Dispatcher::run`] drives the outer loop: while the queue is non-empty
//! and the run hasn't been stopped, claim compatible workers and launch job
//! runners, then await their completion. Job runners may re-inject work at
//! the front of the queue, which is why the outer loop re-checks the queue
//! after every pass.

use super::{
    pool::WorkerPool,
    queue::{QueuedGroup, WorkQueue},
    registry::TestRegistry,
    worker::WorkerHandle,
};
use crate::{
    config::DispatcherConfig,
    errors::DispatchError,
    list::{TestCase, TestGroup, TestId, TestStatus},
    protocol::InitParams,
    reporter::Reporter,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};
use tracing::{debug, warn};

/// Schedules test groups across a bounded pool of worker processes.
///
/// The dispatcher runs on a single logical flow of control: all of its state
/// is mutated from the task polling [`run`](Self::run) (or
/// [`stop`](Self::stop)), and parallelism comes solely from the worker
/// processes. The futures it returns are not `Send`; drive them with a
/// current-thread runtime or `block_on`.
pub struct Dispatcher<R> {
    config: DispatcherConfig,
    pub(super) queue: WorkQueue,
    pub(super) registry: TestRegistry,
    pub(super) pool: WorkerPool,
    reporter: RefCell<R>,
    failure_count: Cell<usize>,
    worker_errors: Cell<bool>,
    stopped: Cell<bool>,
}

impl<R> fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.pool.worker_count())
            .field("failure_count", &self.failure_count.get())
            .field("stopped", &self.stopped.get())
            .finish_non_exhaustive()
    }
}

impl<R: Reporter> Dispatcher<R> {
    /// Creates a dispatcher over the given groups.
    ///
    /// Empty groups are filtered out; no worker is ever claimed for them.
    /// Returns an error if a test id appears more than once across the
    /// groups.
    pub fn new(
        config: DispatcherConfig,
        groups: Vec<TestGroup>,
        reporter: R,
    ) -> Result<Self, DispatchError> {
        let mut registry = TestRegistry::new();
        let mut queued = Vec::with_capacity(groups.len());
        for group in groups {
            if group.tests.is_empty() {
                debug!(hash = %group.worker_hash, "skipping empty test group");
                continue;
            }
            queued.push(QueuedGroup::from_group(&group));
            for test in group.tests {
                registry.insert(test)?;
            }
        }
        Ok(Self {
            pool: WorkerPool::new(config.workers),
            queue: WorkQueue::new(queued),
            registry,
            reporter: RefCell::new(reporter),
            config,
            failure_count: Cell::new(0),
            worker_errors: Cell::new(false),
            stopped: Cell::new(false),
        })
    }

    /// Runs the dispatcher until the queue drains or the run is stopped.
    ///
    /// When the run was stopped — explicitly, or by fail-fast — this waits
    /// for every worker to exit before returning. After a natural drain,
    /// recycled workers stay alive in the free list until [`stop`](Self::stop)
    /// is called.
    ///
    /// The only error propagated from dispatch mechanics is a failure to
    /// spawn a worker process; everything a worker reports is folded into
    /// test results and reporter callbacks.
    pub async fn run(&self) -> Result<(), DispatchError> {
        let mut result = Ok(());
        while result.is_ok() && !self.is_stopped() && !self.queue.is_empty() {
            result = self.dispatch_pass().await;
        }
        if self.is_stopped() {
            self.wait_for_workers_to_exit().await;
        }
        result
    }

    /// Stops the run: no new workers spawn, no new jobs dispatch, retries
    /// are suppressed, and every live worker is asked to tear down.
    /// Completes once all workers have exited. Idempotent.
    pub async fn stop(&self) {
        self.request_stop();
        self.wait_for_workers_to_exit().await;
    }

    /// Whether any worker reported an error outside a test (e.g. during
    /// teardown).
    pub fn has_worker_errors(&self) -> bool {
        self.worker_errors.get()
    }

    /// The number of terminal attempts whose status was unexpected and not
    /// skipped.
    pub fn failure_count(&self) -> usize {
        self.failure_count.get()
    }

    /// Whether the run has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// The number of live worker processes, idle workers included.
    pub fn live_worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Consumes the dispatcher and hands back every test with its
    /// accumulated results, in enqueue order.
    pub fn into_tests(self) -> Vec<TestCase> {
        self.registry.into_tests()
    }

    /// One dispatch pass: greedily drain the current queue, then await all
    /// launched jobs. While a claim is pending, already-launched jobs and
    /// pool exit bookkeeping keep making progress on the same select loop.
    async fn dispatch_pass(&self) -> Result<(), DispatchError> {
        let mut jobs = FuturesUnordered::new();
        let mut failure = None;
        while failure.is_none() && !self.is_stopped() {
            let Some(group) = self.queue.pop_front() else {
                break;
            };
            let claimed = {
                let mut claim = std::pin::pin!(self.obtain_compatible_worker(&group));
                loop {
                    tokio::select! {
                        res = claim.as_mut() => break res,
                        Some(()) = jobs.next(), if !jobs.is_empty() => {}
                        Some(index) = self.pool.next_exit() => self.pool.handle_exit(index),
                    }
                }
            };
            match claimed {
                Ok(Some(worker)) => {
                    if self.is_stopped() {
                        break;
                    }
                    jobs.push(self.run_job(worker, group));
                }
                // Stopped while waiting on a claim.
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "failed to create a worker, stopping the run");
                    self.request_stop();
                    failure = Some(error);
                }
            }
        }
        loop {
            tokio::select! {
                res = jobs.next() => {
                    if res.is_none() {
                        break;
                    }
                }
                Some(index) = self.pool.next_exit() => self.pool.handle_exit(index),
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Claims a worker compatible with the group, discarding recycled
    /// workers whose hash doesn't match. An empty hash never triggers the
    /// check: a just-created worker binds its hash during init to the
    /// requesting group, so it matches by construction.
    async fn obtain_compatible_worker(
        &self,
        group: &QueuedGroup,
    ) -> Result<Option<Rc<WorkerHandle>>, DispatchError> {
        loop {
            let Some(worker) = self.obtain_worker(group).await? else {
                return Ok(None);
            };
            let hash = worker.hash();
            if !self.is_stopped() && !hash.is_empty() && hash != group.worker_hash {
                debug!(
                    worker = worker.index(),
                    worker_hash = %hash,
                    group_hash = %group.worker_hash,
                    "recycled worker is incompatible, discarding"
                );
                worker.stop();
                continue;
            }
            return Ok(Some(worker));
        }
    }

    /// The claim protocol: synchronously pop a free worker or create one
    /// under the maximum, otherwise suspend as a claimer and retry once
    /// resumed. Returns `None` if the run stops while claiming.
    async fn obtain_worker(
        &self,
        group: &QueuedGroup,
    ) -> Result<Option<Rc<WorkerHandle>>, DispatchError> {
        loop {
            if self.is_stopped() {
                return Ok(None);
            }
            if let Some(worker) = self.pool.claim_free() {
                return Ok(Some(worker));
            }
            if self.pool.has_capacity() {
                let worker = self.pool.create_worker(&self.config)?;
                worker
                    .init(
                        &group.worker_hash,
                        InitParams {
                            worker_index: worker.index(),
                            repeat_each_index: group.repeat_each_index,
                            project_index: group.project_index,
                            loader: self.config.loader.clone(),
                        },
                    )
                    .await;
                return Ok(Some(worker));
            }
            self.pool.wait_for_claim().await;
        }
    }

    /// Drives exit bookkeeping until every worker is gone.
    async fn wait_for_workers_to_exit(&self) {
        while !self.pool.is_empty() {
            match self.pool.next_exit().await {
                Some(index) => self.pool.handle_exit(index),
                None => break,
            }
        }
    }

    pub(super) fn request_stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        debug!(workers = self.pool.worker_count(), "stop requested");
        self.pool.stop_all();
    }

    pub(super) fn has_reached_max_failures(&self) -> bool {
        self.config.max_failures > 0 && self.failure_count.get() >= self.config.max_failures
    }

    pub(super) fn mark_worker_errors(&self) {
        self.worker_errors.set(true);
    }

    pub(super) fn reporter_mut(&self) -> std::cell::RefMut<'_, R> {
        self.reporter.borrow_mut()
    }

    pub(super) fn report_test_begin(&self, test: &TestCase) {
        self.reporter.borrow_mut().on_test_begin(test);
    }

    /// Reports a terminal attempt: counts it against fail-fast if its status
    /// was unexpected, forwards it to the reporter, and initiates a stop the
    /// moment the failure count reaches the maximum.
    pub(super) fn report_test_end(&self, test_id: &TestId) {
        let reported = self.registry.with(test_id, |test| {
            let result = test
                .results
                .last()
                .expect("registered test has at least one result");
            if result.status != TestStatus::Skipped && result.status != test.expected_status {
                self.failure_count.set(self.failure_count.get() + 1);
            }
            self.reporter.borrow_mut().on_test_end(test, result);
        });
        if reported.is_none() {
            debug!(test = %test_id, "testEnd for unknown test id");
            return;
        }
        if self.config.max_failures > 0 && self.failure_count.get() == self.config.max_failures {
            debug!(
                failures = self.failure_count.get(),
                "reached max failures, stopping the run"
            );
            self.request_stop();
        }
    }
}
