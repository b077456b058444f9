// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire protocol between the dispatcher and its workers.
//!
//! Every message is a JSON object `{"method": ..., "params": ...}`, one per
//! line, carried over the worker's stdin (dispatcher to worker) and stdout
//! (worker to dispatcher). Workers reserve stdout for protocol frames and
//! report test output through [`StdOut`](WorkerMessage::StdOut) /
//! [`StdErr`](WorkerMessage::StdErr) messages.
//!
//! The handshake: `init` must be the first message a worker receives, and the
//! worker's next frame — of any shape — is the ready acknowledgement. After
//! that, a single `run` streams test events back, terminated by `done`.
//!
//! These types are public so worker implementations can share them.

use crate::list::{Annotation, TestError, TestId, TestStatus};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message sent from the dispatcher to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Initializes the worker. Must be the first message.
    Init(InitParams),

    /// Runs a group of tests. Sent at most once after `init`.
    Run(RunParams),

    /// Requests graceful teardown.
    Stop(StopParams),
}

/// Parameters for [`WorkerRequest::Init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    /// The worker's index.
    pub worker_index: u32,

    /// The repeat-each iteration of the initiating group.
    pub repeat_each_index: u32,

    /// The project of the initiating group.
    pub project_index: u32,

    /// The serialized loader image, opaque to the dispatcher.
    pub loader: Value,
}

/// Parameters for [`WorkerRequest::Run`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    /// The group's file handle.
    pub file: Utf8PathBuf,

    /// The tests to run, in order.
    pub entries: Vec<RunEntry>,
}

/// One test within a [`RunParams`] batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    /// The test to run.
    pub test_id: TestId,

    /// Which attempt this is, starting at 0.
    pub retry: u32,
}

/// Parameters for [`WorkerRequest::Stop`]. Empty on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StopParams {}

/// A message sent from a worker to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// A test attempt started.
    TestBegin(TestBeginParams),

    /// A test attempt finished.
    TestEnd(TestEndParams),

    /// A chunk of stdout, optionally attributed to a test.
    StdOut(TestOutputParams),

    /// A chunk of stderr, optionally attributed to a test.
    StdErr(TestOutputParams),

    /// An error occurred outside any test, e.g. during teardown.
    TeardownError(TeardownErrorParams),

    /// The current `run` is over. Terminal.
    Done(DoneParams),
}

/// Parameters for [`WorkerMessage::TestBegin`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBeginParams {
    /// The test that started.
    pub test_id: TestId,

    /// The index of the worker the test is running on.
    pub worker_index: u32,

    /// Wall-clock start time, in milliseconds since the Unix epoch.
    pub start_wall_time: f64,
}

/// Parameters for [`WorkerMessage::TestEnd`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEndParams {
    /// The test that finished.
    pub test_id: TestId,

    /// How long the attempt took, in milliseconds.
    pub duration: f64,

    /// The error the attempt failed with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,

    /// Attachments produced by the attempt.
    #[serde(default)]
    pub attachments: Vec<AttachmentParams>,

    /// The attempt's terminal status.
    pub status: TestStatus,

    /// The status the test is expected to finish with, as (re-)evaluated by
    /// the worker.
    pub expected_status: TestStatus,

    /// Annotations attached by the worker runtime.
    #[serde(default)]
    pub annotations: Vec<Annotation>,

    /// The timeout the worker enforced, in milliseconds.
    #[serde(default)]
    pub timeout: f64,
}

/// An attachment as carried on the wire: inline bodies are base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentParams {
    /// The attachment name.
    pub name: String,

    /// A path to the attachment on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    /// The attachment's MIME type.
    pub content_type: String,

    /// The inline body, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Parameters for [`WorkerMessage::StdOut`] and [`WorkerMessage::StdErr`].
///
/// Exactly one of `text` and `buffer` is present.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutputParams {
    /// The test the output belongs to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<TestId>,

    /// A text chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// A binary chunk, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
}

/// Parameters for [`WorkerMessage::TeardownError`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownErrorParams {
    /// The reported error.
    pub error: TestError,
}

/// Parameters for [`WorkerMessage::Done`].
///
/// An empty `done` means the run finished cleanly. `failed_test_id` names a
/// test that failed in a way that poisons the worker; `fatal_error` reports a
/// condition that prevented the rest of the group from executing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneParams {
    /// The test implicated in a per-test fatal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_test_id: Option<TestId>,

    /// A worker-fatal error with no per-test attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<TestError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_method_params_framing() {
        let init = WorkerRequest::Init(InitParams {
            worker_index: 3,
            repeat_each_index: 1,
            project_index: 0,
            loader: json!({"configFile": "dispatch.config"}),
        });
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({
                "method": "init",
                "params": {
                    "workerIndex": 3,
                    "repeatEachIndex": 1,
                    "projectIndex": 0,
                    "loader": {"configFile": "dispatch.config"},
                }
            }),
        );

        let run = WorkerRequest::Run(RunParams {
            file: "tests/a.spec".into(),
            entries: vec![RunEntry {
                test_id: "t1".into(),
                retry: 1,
            }],
        });
        assert_eq!(
            serde_json::to_value(&run).unwrap(),
            json!({
                "method": "run",
                "params": {
                    "file": "tests/a.spec",
                    "entries": [{"testId": "t1", "retry": 1}],
                }
            }),
        );

        let stop = WorkerRequest::Stop(StopParams::default());
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            json!({"method": "stop", "params": {}}),
        );
    }

    #[test]
    fn parses_test_lifecycle_messages() {
        let message: WorkerMessage = serde_json::from_str(
            r#"{"method":"testBegin","params":{"testId":"t1","workerIndex":0,"startWallTime":1722000000000}}"#,
        )
        .unwrap();
        let WorkerMessage::TestBegin(params) = message else {
            panic!("expected testBegin, got {message:?}");
        };
        assert_eq!(params.test_id, "t1".into());
        assert_eq!(params.worker_index, 0);

        let message: WorkerMessage = serde_json::from_str(
            r#"{"method":"testEnd","params":{"testId":"t1","duration":12.5,"status":"timedOut","expectedStatus":"passed","annotations":[{"type":"slow"}],"timeout":30000,"attachments":[{"name":"trace","contentType":"application/octet-stream","body":"AQID"}]}}"#,
        )
        .unwrap();
        let WorkerMessage::TestEnd(params) = message else {
            panic!("expected testEnd, got {message:?}");
        };
        assert_eq!(params.status, TestStatus::TimedOut);
        assert_eq!(params.annotations[0].kind, "slow");
        assert_eq!(params.attachments[0].body.as_deref(), Some("AQID"));
    }

    #[test]
    fn parses_done_in_all_shapes() {
        let done: WorkerMessage =
            serde_json::from_str(r#"{"method":"done","params":{}}"#).unwrap();
        let WorkerMessage::Done(params) = done else {
            panic!("expected done");
        };
        assert!(params.failed_test_id.is_none() && params.fatal_error.is_none());

        let done: WorkerMessage =
            serde_json::from_str(r#"{"method":"done","params":{"failedTestId":"t2"}}"#).unwrap();
        let WorkerMessage::Done(params) = done else {
            panic!("expected done");
        };
        assert_eq!(params.failed_test_id, Some("t2".into()));

        let done: WorkerMessage = serde_json::from_str(
            r#"{"method":"done","params":{"fatalError":{"value":"boom","stack":"at x"}}}"#,
        )
        .unwrap();
        let WorkerMessage::Done(params) = done else {
            panic!("expected done");
        };
        assert_eq!(params.fatal_error.unwrap().value, "boom");
    }

    #[test]
    fn output_carries_text_or_buffer() {
        let message: WorkerMessage = serde_json::from_str(
            r#"{"method":"stdOut","params":{"testId":"t1","text":"hello\n"}}"#,
        )
        .unwrap();
        let WorkerMessage::StdOut(params) = message else {
            panic!("expected stdOut");
        };
        assert_eq!(params.text.as_deref(), Some("hello\n"));
        assert!(params.buffer.is_none());

        let message: WorkerMessage =
            serde_json::from_str(r#"{"method":"stdErr","params":{"buffer":"AQID"}}"#).unwrap();
        let WorkerMessage::StdErr(params) = message else {
            panic!("expected stdErr");
        };
        assert!(params.test_id.is_none());
        assert_eq!(params.buffer.as_deref(), Some("AQID"));
    }
}
