// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The job runner: drives one `(worker, group)` pair to completion.
//!
//! A job subscribes to its worker's events, sends the `run`, and interprets
//! the terminal `done` (or synthesized equivalent on exit). A cleanly
//! finished worker is recycled through the free list; any other outcome
//! discards the worker, attributes failures, selects retry candidates, and
//! re-enqueues whatever is left of the group at the front of the queue.

use super::{
    queue::QueuedGroup,
    worker::{WorkerEvent, WorkerHandle},
    Dispatcher,
};
use crate::{
    list::{TestAttachment, TestError, TestId, TestOutputChunk, TestResult, TestStatus},
    protocol::{
        AttachmentParams, DoneParams, RunEntry, TestBeginParams, TestEndParams, TestOutputParams,
        TeardownErrorParams, WorkerMessage,
    },
    reporter::Reporter,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset};
use std::{rc::Rc, time::Duration};
use tracing::debug;

/// The error attributed to a group when its worker dies without reporting.
const UNEXPECTED_EXIT: &str = "Worker process exited unexpectedly";

/// Per-job state.
struct JobState {
    /// Tests in the group not yet terminated by a `testEnd`, in group order.
    remaining: Vec<TestId>,
    /// The most recent test announced by `testBegin`.
    last_started: Option<TestId>,
}

#[derive(Clone, Copy)]
enum StdStream {
    Out,
    Err,
}

impl<R: Reporter> Dispatcher<R> {
    /// Runs one group on one worker, resolving when a terminal event is
    /// observed and its policy has been applied.
    pub(super) async fn run_job(&self, worker: Rc<WorkerHandle>, group: QueuedGroup) {
        let entries = group
            .test_ids
            .iter()
            .map(|test_id| RunEntry {
                test_id: test_id.clone(),
                retry: self.registry.result_count(test_id).saturating_sub(1) as u32,
            })
            .collect();
        worker.run(&group.require_file, entries);
        debug!(
            worker = worker.index(),
            tests = group.test_ids.len(),
            "job started"
        );

        let mut job = JobState {
            remaining: group.test_ids.clone(),
            last_started: None,
        };
        let done = loop {
            match worker.recv().await {
                Some(WorkerEvent::Message(WorkerMessage::TestBegin(params))) => {
                    self.handle_test_begin(&mut job, params);
                }
                Some(WorkerEvent::Message(WorkerMessage::TestEnd(params))) => {
                    self.handle_test_end(&mut job, params);
                }
                Some(WorkerEvent::Message(WorkerMessage::StdOut(params))) => {
                    self.handle_output(params, StdStream::Out);
                }
                Some(WorkerEvent::Message(WorkerMessage::StdErr(params))) => {
                    self.handle_output(params, StdStream::Err);
                }
                Some(WorkerEvent::Message(WorkerMessage::TeardownError(params))) => {
                    self.handle_teardown_error(params);
                }
                Some(WorkerEvent::Message(WorkerMessage::Done(params))) => break params,
                Some(WorkerEvent::Raw(frame)) => {
                    debug!(worker = worker.index(), %frame, "ignoring unrecognized frame");
                }
                Some(WorkerEvent::Exit) | None => break self.synthesize_done(&worker),
            }
        };
        self.finish_job(&worker, &group, job, done);
    }

    /// An exit is a clean finish if we asked the worker to stop, and a fatal
    /// error otherwise.
    fn synthesize_done(&self, worker: &WorkerHandle) -> DoneParams {
        if worker.did_send_stop() {
            debug!(worker = worker.index(), "worker exited after stop");
            DoneParams::default()
        } else {
            debug!(worker = worker.index(), "worker exited unexpectedly");
            DoneParams {
                failed_test_id: None,
                fatal_error: Some(TestError::new(UNEXPECTED_EXIT)),
            }
        }
    }

    /// Terminal policy on `done`.
    fn finish_job(
        &self,
        worker: &Rc<WorkerHandle>,
        group: &QueuedGroup,
        mut job: JobState,
        done: DoneParams,
    ) {
        if job.remaining.is_empty() && done.failed_test_id.is_none() && done.fatal_error.is_none()
        {
            debug!(worker = worker.index(), "job finished cleanly");
            self.pool.release(worker.clone());
            return;
        }

        // The worker is not trusted to run anything further.
        worker.stop();

        let mut retry_candidates = Vec::new();
        if let Some(fatal_error) = &done.fatal_error {
            // Attribute the fatal error across the group: the first
            // remaining test failed with it, the rest never ran. Only the
            // failed test is a retry candidate; skipped outcomes are not
            // retried.
            let mut first = true;
            for test_id in &job.remaining {
                if self.has_reached_max_failures() {
                    break;
                }
                let announced = job.last_started.as_ref() == Some(test_id);
                let status = if first {
                    TestStatus::Failed
                } else {
                    TestStatus::Skipped
                };
                let found = self.registry.with(test_id, |test| {
                    if !announced {
                        // The worker never announced this test.
                        self.report_test_begin(test);
                    }
                    let result = test.current_result_mut();
                    result.error = Some(fatal_error.clone());
                    result.status = status;
                });
                if found.is_none() {
                    debug!(test = %test_id, "fatal cleanup for unknown test id");
                    continue;
                }
                self.report_test_end(test_id);
                if first {
                    retry_candidates.push(test_id.clone());
                }
                first = false;
            }
            // Under a fatal error nothing from this group is left to run.
            job.remaining.clear();
        } else if let Some(failed_test_id) = done.failed_test_id {
            retry_candidates.push(failed_test_id);
        }

        for test_id in retry_candidates {
            let will_retry = self
                .registry
                .with(&test_id, |test| {
                    if self.is_stopped() || test.expected_status != TestStatus::Passed {
                        return false;
                    }
                    if test.results.len() >= test.retries as usize + 1 {
                        return false;
                    }
                    // Rebind the current result: event handlers for the next
                    // attempt write into the fresh one.
                    test.results.push(TestResult::new());
                    true
                })
                .unwrap_or(false);
            if will_retry {
                debug!(test = %test_id, "scheduling retry");
                job.remaining.insert(0, test_id);
            }
        }

        if !job.remaining.is_empty() {
            debug!(
                worker = worker.index(),
                remaining = job.remaining.len(),
                "re-enqueuing remaining tests at the front of the queue"
            );
            self.queue
                .push_front(group.with_tests(std::mem::take(&mut job.remaining)));
        }
    }

    fn handle_test_begin(&self, job: &mut JobState, params: TestBeginParams) {
        job.last_started = Some(params.test_id.clone());
        if self.has_reached_max_failures() {
            return;
        }
        let found = self.registry.with(&params.test_id, |test| {
            let result = test.current_result_mut();
            result.worker_index = Some(params.worker_index);
            result.start_time = wall_time_to_start(params.start_wall_time);
            self.report_test_begin(test);
        });
        if found.is_none() {
            debug!(test = %params.test_id, "testBegin for unknown test id");
        }
    }

    fn handle_test_end(&self, job: &mut JobState, params: TestEndParams) {
        job.remaining.retain(|test_id| *test_id != params.test_id);
        if self.has_reached_max_failures() {
            return;
        }
        let test_id = params.test_id.clone();
        let found = self.registry.with(&test_id, |test| {
            test.expected_status = params.expected_status;
            test.annotations = params.annotations;
            test.timeout = Some(millis_to_duration(params.timeout));
            let result = test.current_result_mut();
            result.duration = millis_to_duration(params.duration);
            result.error = params.error;
            result.status = params.status;
            result.attachments = params
                .attachments
                .into_iter()
                .map(decode_attachment)
                .collect();
        });
        if found.is_none() {
            debug!(test = %test_id, "testEnd for unknown test id");
            return;
        }
        self.report_test_end(&test_id);
    }

    fn handle_output(&self, params: TestOutputParams, stream: StdStream) {
        let chunk = match (&params.text, &params.buffer) {
            (Some(text), _) => TestOutputChunk::Text(text.clone()),
            (None, Some(buffer)) => TestOutputChunk::Bytes(decode_base64(buffer)),
            (None, None) => TestOutputChunk::Text(String::new()),
        };
        match &params.test_id {
            Some(test_id) => {
                let forwarded = self.registry.with(test_id, |test| {
                    let result = test.current_result_mut();
                    match stream {
                        StdStream::Out => result.stdout.push(chunk.clone()),
                        StdStream::Err => result.stderr.push(chunk.clone()),
                    }
                    let mut reporter = self.reporter_mut();
                    match stream {
                        StdStream::Out => reporter.on_std_out(&chunk, Some(test)),
                        StdStream::Err => reporter.on_std_err(&chunk, Some(test)),
                    }
                });
                if forwarded.is_none() {
                    debug!(test = %test_id, "output for unknown test id");
                    self.forward_unattributed(&chunk, stream);
                }
            }
            None => self.forward_unattributed(&chunk, stream),
        }
    }

    fn forward_unattributed(&self, chunk: &TestOutputChunk, stream: StdStream) {
        let mut reporter = self.reporter_mut();
        match stream {
            StdStream::Out => reporter.on_std_out(chunk, None),
            StdStream::Err => reporter.on_std_err(chunk, None),
        }
    }

    fn handle_teardown_error(&self, params: TeardownErrorParams) {
        debug!(error = %params.error, "worker reported a teardown error");
        self.mark_worker_errors();
        self.reporter_mut().on_error(&params.error);
    }
}

fn wall_time_to_start(millis: f64) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(millis as i64).map(|start| start.fixed_offset())
}

fn millis_to_duration(millis: f64) -> Duration {
    Duration::from_secs_f64(millis.max(0.0) / 1000.0)
}

fn decode_base64(data: &str) -> Vec<u8> {
    match STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(error) => {
            debug!(%error, "failed to decode base64 payload from worker");
            Vec::new()
        }
    }
}

fn decode_attachment(params: AttachmentParams) -> TestAttachment {
    TestAttachment {
        name: params.name,
        path: params.path,
        content_type: params.content_type,
        body: params.body.map(|body| decode_base64(&body)),
    }
}
