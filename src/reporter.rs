// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporter interface.
//!
//! A [`Reporter`] is the external consumer of test lifecycle events. The
//! dispatcher invokes every callback on its single flow of control, in the
//! order events are observed from the workers. All callbacks have default
//! no-op implementations, so reporters implement only what they consume.

use crate::list::{TestCase, TestError, TestOutputChunk, TestResult};

/// Consumes test lifecycle events emitted by the dispatcher.
pub trait Reporter {
    /// A test attempt started on a worker.
    ///
    /// For tests terminated by a worker-fatal error before the worker
    /// announced them, the dispatcher synthesizes this call itself.
    fn on_test_begin(&mut self, _test: &TestCase) {}

    /// A test attempt finished. `result` is the attempt's final state.
    fn on_test_end(&mut self, _test: &TestCase, _result: &TestResult) {}

    /// A chunk of stdout arrived, attributed to `test` when the worker
    /// included a test id.
    fn on_std_out(&mut self, _chunk: &TestOutputChunk, _test: Option<&TestCase>) {}

    /// A chunk of stderr arrived, attributed to `test` when the worker
    /// included a test id.
    fn on_std_err(&mut self, _chunk: &TestOutputChunk, _test: Option<&TestCase>) {}

    /// A worker reported an error outside any test, e.g. during teardown.
    fn on_error(&mut self, _error: &TestError) {}
}

/// A reporter that discards all events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}
