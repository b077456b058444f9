// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test model shared between the dispatcher, the reporter, and the wire
//! protocol.
//!
//! [`TestCase`] is the unit of identity: it accumulates one [`TestResult`]
//! per attempt. [`TestGroup`] is the unit of scheduling: an ordered batch of
//! tests sharing a worker-compatibility hash, dispatched to a single worker
//! as one `run`.

use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, time::Duration};

/// The stable identity of a test.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(SmolStr);

impl TestId {
    /// Creates a new test id.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// The terminal status of a test attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    /// The test passed.
    Passed,
    /// The test failed.
    Failed,
    /// The test did not run, or its attempt was abandoned.
    Skipped,
    /// The test exceeded its timeout.
    TimedOut,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
            TestStatus::TimedOut => "timedOut",
        };
        f.write_str(s)
    }
}

/// An error reported by a worker, attached to a test result or surfaced
/// through [`Reporter::on_error`](crate::reporter::Reporter::on_error).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestError {
    /// A human-readable description of the error.
    pub value: String,

    /// An optional stack trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TestError {
    /// Creates a new error with the given description.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            stack: None,
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// An annotation attached to a test by the worker runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// The annotation kind, e.g. `skip` or `slow`.
    #[serde(rename = "type")]
    pub kind: String,

    /// An optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A chunk of test output: either text or raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestOutputChunk {
    /// A text chunk.
    Text(String),
    /// A binary chunk.
    Bytes(Vec<u8>),
}

impl TestOutputChunk {
    /// Returns the chunk contents as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TestOutputChunk::Text(text) => text.as_bytes(),
            TestOutputChunk::Bytes(bytes) => bytes,
        }
    }
}

/// A file or inline payload attached to a test result by the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestAttachment {
    /// The attachment name.
    pub name: String,

    /// A path to the attachment on disk, if it was written out-of-band.
    pub path: Option<Utf8PathBuf>,

    /// The attachment's MIME type.
    pub content_type: String,

    /// The decoded inline body, if one was sent over the wire.
    pub body: Option<Vec<u8>>,
}

/// The outcome of a single attempt at running a test.
///
/// A fresh result starts out [`Skipped`](TestStatus::Skipped) with no worker
/// assigned; the dispatcher fills it in as the worker reports progress.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// The index of the worker the attempt ran on.
    pub worker_index: Option<u32>,

    /// The wall-clock time at which the attempt started.
    pub start_time: Option<DateTime<FixedOffset>>,

    /// How long the attempt took.
    pub duration: Duration,

    /// The terminal status of the attempt.
    pub status: TestStatus,

    /// The error the attempt failed with, if any.
    pub error: Option<TestError>,

    /// Ordered stdout chunks captured during the attempt.
    pub stdout: Vec<TestOutputChunk>,

    /// Ordered stderr chunks captured during the attempt.
    pub stderr: Vec<TestOutputChunk>,

    /// Attachments reported with the attempt.
    pub attachments: Vec<TestAttachment>,
}

impl TestResult {
    /// Creates a blank result.
    pub fn new() -> Self {
        Self {
            worker_index: None,
            start_time: None,
            duration: Duration::ZERO,
            status: TestStatus::Skipped,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

impl Default for TestResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A test known to the dispatcher.
///
/// `results` is append-only: the dispatcher appends a blank result when the
/// test is first enqueued and again each time a retry begins. The last
/// element is always the attempt currently being written to.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// The test's stable identity.
    pub id: TestId,

    /// The status this test is expected to finish with. Attempts finishing
    /// with any other non-skipped status count as unexpected failures.
    pub expected_status: TestStatus,

    /// How many additional attempts are allowed after a failed attempt that
    /// was expected to pass.
    pub retries: u32,

    /// The per-test timeout enforced by the worker, as reported back on
    /// `testEnd`.
    pub timeout: Option<Duration>,

    /// Annotations reported by the worker runtime.
    pub annotations: Vec<Annotation>,

    /// One result per attempt, oldest first.
    pub results: Vec<TestResult>,
}

impl TestCase {
    /// Creates a new test case with no retries and no results.
    pub fn new(id: impl Into<TestId>, expected_status: TestStatus) -> Self {
        Self {
            id: id.into(),
            expected_status,
            retries: 0,
            timeout: None,
            annotations: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Sets the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Returns the result of the most recent attempt, if any.
    pub fn last_result(&self) -> Option<&TestResult> {
        self.results.last()
    }

    /// The attempt currently being written to.
    ///
    /// Panics if the test has no results; the dispatcher seeds every
    /// registered test with one.
    pub(crate) fn current_result_mut(&mut self) -> &mut TestResult {
        self.results
            .last_mut()
            .expect("registered test has at least one result")
    }
}

/// An ordered batch of tests dispatched to a single worker as one unit.
///
/// Workers are specialized to one compatibility hash at init time and may
/// only execute groups carrying the same hash. Groups are immutable once
/// enqueued; when a group partially completes, the dispatcher constructs a
/// new group with the remaining tests and re-enqueues it.
#[derive(Clone, Debug)]
pub struct TestGroup {
    /// The worker-compatibility hash. Opaque to the dispatcher.
    pub worker_hash: SmolStr,

    /// The file handle passed to the worker's `run` message.
    pub require_file: Utf8PathBuf,

    /// The repeat-each iteration this group belongs to.
    pub repeat_each_index: u32,

    /// The project this group belongs to.
    pub project_index: u32,

    /// The tests in the group, in execution order.
    pub tests: Vec<TestCase>,
}

impl TestGroup {
    /// Creates a new, empty group.
    pub fn new(worker_hash: impl Into<SmolStr>, require_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            worker_hash: worker_hash.into(),
            require_file: require_file.into(),
            repeat_each_index: 0,
            project_index: 0,
            tests: Vec::new(),
        }
    }

    /// Appends a test to the group.
    pub fn with_test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }
}
