// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker handle: one child process speaking the wire protocol.
//!
//! The handle owns the protocol endpoints of a single worker. Commands are
//! enqueued on a channel drained by a writer task that owns the child's
//! stdin; inbound frames are parsed by a reader task that owns the child's
//! stdout and, once the stream closes, reaps the child and emits a single
//! `Exit` event. Scheduling decisions live entirely outside the handle.

use crate::{
    config::{WorkerCommand, WORKER_INDEX_ENV},
    protocol::{InitParams, RunEntry, RunParams, StopParams, WorkerMessage, WorkerRequest},
};
use camino::Utf8Path;
use serde_json::Value;
use smol_str::SmolStr;
use std::{
    cell::{Cell, RefCell},
    io::{self, IsTerminal},
    process::Stdio,
    rc::Rc,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Child,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::debug;

/// An event observed from a worker.
#[derive(Debug)]
pub(super) enum WorkerEvent {
    /// A recognized protocol message.
    Message(WorkerMessage),

    /// A frame without a recognized method. The init ack takes this shape;
    /// anything else is ignored by the job runner.
    Raw(Value),

    /// The worker process exited. Emitted exactly once, after which the
    /// event stream ends.
    Exit,
}

/// A handle to one worker process.
///
/// At most one job runner is attached to a handle at any instant; the event
/// receiver is single-consumer by construction.
#[derive(Debug)]
pub(super) struct WorkerHandle {
    index: u32,
    // Empty until the first init, then fixed for the worker's lifetime.
    hash: RefCell<SmolStr>,
    // One-way latch distinguishing intentional from unexpected termination.
    did_send_stop: Cell<bool>,
    requests: UnboundedSender<WorkerRequest>,
    events: RefCell<UnboundedReceiver<WorkerEvent>>,
}

impl WorkerHandle {
    /// Spawns a worker process and starts its IO tasks.
    ///
    /// `exit_tx` receives the worker's index when the process exits, for
    /// pool bookkeeping independent of any attached job.
    pub(super) fn spawn(
        spec: &WorkerCommand,
        index: u32,
        forward_stderr: bool,
        exit_tx: UnboundedSender<u32>,
    ) -> io::Result<Rc<Self>> {
        let mut command = tokio::process::Command::new(spec.program.as_str());
        command.args(&spec.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        // Piping a stream we'd never read slows down termination; discard
        // stderr unless the debug flag routes it to the parent.
        command.stderr(if forward_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        let color = if std::io::stdout().is_terminal() {
            "1"
        } else {
            "0"
        };
        command
            .env("FORCE_COLOR", color)
            .env("DEBUG_COLORS", color)
            .env(WORKER_INDEX_ENV, index.to_string());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        debug!(worker = index, program = %spec.program, "spawned worker process");
        Ok(Self::start(index, stdout, stdin, Some(child), exit_tx))
    }

    /// Builds a handle over arbitrary streams, for driving the protocol
    /// in-process.
    #[cfg(test)]
    pub(super) fn from_streams(
        index: u32,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Rc<Self> {
        let (exit_tx, _exit_rx) = unbounded_channel();
        Self::start(index, reader, writer, None, exit_tx)
    }

    fn start(
        index: u32,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        child: Option<Child>,
        exit_tx: UnboundedSender<u32>,
    ) -> Rc<Self> {
        let (requests_tx, requests_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        tokio::spawn(write_requests(index, requests_rx, writer));
        tokio::spawn(read_events(index, reader, child, events_tx, exit_tx));
        Rc::new(Self {
            index,
            hash: RefCell::new(SmolStr::default()),
            did_send_stop: Cell::new(false),
            requests: requests_tx,
            events: RefCell::new(events_rx),
        })
    }

    pub(super) fn index(&self) -> u32 {
        self.index
    }

    /// The compatibility hash this worker was initialized with. Empty before
    /// the first init.
    pub(super) fn hash(&self) -> SmolStr {
        self.hash.borrow().clone()
    }

    pub(super) fn did_send_stop(&self) -> bool {
        self.did_send_stop.get()
    }

    /// Initializes the worker for groups with the given hash.
    ///
    /// The hash is recorded before the message is sent, so the worker
    /// matches its initiating group by construction. The next inbound frame,
    /// whatever its shape, is the ready acknowledgement; it is consumed here
    /// and never re-dispatched.
    pub(super) async fn init(&self, worker_hash: &SmolStr, params: InitParams) {
        *self.hash.borrow_mut() = worker_hash.clone();
        self.send(WorkerRequest::Init(params));
        match self.recv().await {
            Some(WorkerEvent::Message(_) | WorkerEvent::Raw(_)) => {
                debug!(worker = self.index, hash = %worker_hash, "worker initialized");
            }
            Some(WorkerEvent::Exit) | None => {
                // The attached job observes the exit and applies fatal-error
                // policy; nothing to do here.
                debug!(worker = self.index, "worker exited before acknowledging init");
            }
        }
    }

    /// Sends a batch of tests to run. Responses arrive as streaming events
    /// terminating in `done`.
    pub(super) fn run(&self, file: &Utf8Path, entries: Vec<RunEntry>) {
        // A recycled worker may have trailing frames from its previous job;
        // they belong to no attached runner and are dropped.
        self.drain_pending();
        self.send(WorkerRequest::Run(RunParams {
            file: file.to_owned(),
            entries,
        }));
    }

    /// Requests graceful teardown. Idempotent: only the first call sends.
    pub(super) fn stop(&self) {
        if self.did_send_stop.replace(true) {
            return;
        }
        debug!(worker = self.index, "stopping worker");
        self.send(WorkerRequest::Stop(StopParams::default()));
    }

    /// Receives the next event. Returns `None` once `Exit` has been
    /// delivered and the stream is closed.
    pub(super) async fn recv(&self) -> Option<WorkerEvent> {
        std::future::poll_fn(|cx| self.events.borrow_mut().poll_recv(cx)).await
    }

    fn drain_pending(&self) {
        let mut events = self.events.borrow_mut();
        while let Ok(event) = events.try_recv() {
            debug!(worker = self.index, ?event, "discarding stale worker event");
        }
    }

    fn send(&self, request: WorkerRequest) {
        // The channel closes when the writer task ends, i.e. the worker is
        // dead. Sends to a dead worker never raise above the handle.
        if self.requests.send(request).is_err() {
            debug!(worker = self.index, "worker is gone, dropping request");
        }
    }
}

async fn write_requests(
    index: u32,
    mut requests: UnboundedReceiver<WorkerRequest>,
    mut writer: impl AsyncWrite + Unpin,
) {
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(error) => {
                debug!(worker = index, %error, "failed to encode request");
                continue;
            }
        };
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
            debug!(worker = index, "worker stdin closed, dropping requests");
            break;
        }
    }
}

async fn read_events(
    index: u32,
    reader: impl AsyncRead + Unpin,
    child: Option<Child>,
    events_tx: UnboundedSender<WorkerEvent>,
    exit_tx: UnboundedSender<u32>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some(event) = parse_frame(index, line) else {
                    continue;
                };
                if events_tx.send(event).is_err() {
                    // The handle is gone; keep going just to reap the child.
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(worker = index, %error, "error reading from worker");
                break;
            }
        }
    }
    if let Some(mut child) = child {
        match child.wait().await {
            Ok(status) => debug!(worker = index, %status, "worker process exited"),
            Err(error) => debug!(worker = index, %error, "failed to wait on worker process"),
        }
    }
    let _ = events_tx.send(WorkerEvent::Exit);
    let _ = exit_tx.send(index);
}

fn parse_frame(index: u32, line: &str) -> Option<WorkerEvent> {
    match serde_json::from_str::<WorkerMessage>(line) {
        Ok(message) => Some(WorkerEvent::Message(message)),
        Err(_) => match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(WorkerEvent::Raw(value)),
            Err(error) => {
                debug!(worker = index, %error, "discarding unparseable frame");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, split};

    fn handle_pair() -> (
        Rc<WorkerHandle>,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (worker_side, test_side) = duplex(64 * 1024);
        let (reader, writer) = split(worker_side);
        let handle = WorkerHandle::from_streams(5, reader, writer);
        let (their_reader, their_writer) = split(test_side);
        (handle, BufReader::new(their_reader), their_writer)
    }

    async fn next_frame(
        reader: &mut BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn init_params() -> InitParams {
        InitParams {
            worker_index: 5,
            repeat_each_index: 0,
            project_index: 0,
            loader: Value::Null,
        }
    }

    #[tokio::test]
    async fn init_records_hash_and_consumes_ack() {
        let (handle, mut reader, mut writer) = handle_pair();
        assert_eq!(handle.hash(), "");

        // Pre-buffer an ack of arbitrary shape, then a real message.
        writer.write_all(b"{}\n").await.unwrap();
        writer
            .write_all(b"{\"method\":\"done\",\"params\":{}}\n")
            .await
            .unwrap();

        handle.init(&SmolStr::new("hash-a"), init_params()).await;
        assert_eq!(handle.hash(), "hash-a");

        let frame = next_frame(&mut reader).await;
        assert_eq!(frame["method"], "init");
        assert_eq!(frame["params"]["workerIndex"], 5);

        // The ack was consumed; the first observable event is the message
        // after it.
        let event = handle.recv().await.unwrap();
        assert!(
            matches!(
                event,
                WorkerEvent::Message(WorkerMessage::Done(ref params))
                    if params.failed_test_id.is_none()
            ),
            "expected done, got {event:?}"
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (handle, mut reader, _writer) = handle_pair();
        assert!(!handle.did_send_stop());

        handle.stop();
        handle.stop();
        handle.stop();
        assert!(handle.did_send_stop());

        let frame = next_frame(&mut reader).await;
        assert_eq!(frame, json!({"method": "stop", "params": {}}));

        // Requests are written in order: if any of the repeated stops had
        // been sent, it would precede this run frame.
        handle.run(Utf8Path::new("tests/a.spec"), Vec::new());
        let frame = next_frame(&mut reader).await;
        assert_eq!(frame["method"], "run", "only the first stop was sent");
    }

    #[tokio::test]
    async fn closed_stream_emits_exit_then_none() {
        let (handle, _reader, mut writer) = handle_pair();
        writer.shutdown().await.unwrap();
        assert!(matches!(handle.recv().await, Some(WorkerEvent::Exit)));
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped() {
        let (handle, _reader, mut writer) = handle_pair();
        writer.write_all(b"not json at all\n").await.unwrap();
        writer
            .write_all(b"{\"method\":\"testBegin\",\"params\":{\"testId\":\"t1\",\"workerIndex\":5,\"startWallTime\":0}}\n")
            .await
            .unwrap();
        let event = handle.recv().await.unwrap();
        assert!(
            matches!(
                event,
                WorkerEvent::Message(WorkerMessage::TestBegin(ref params))
                    if params.test_id == "t1".into()
            ),
            "expected testBegin, got {event:?}"
        );
    }

    #[tokio::test]
    async fn run_drains_stale_frames() {
        let (handle, mut reader, mut writer) = handle_pair();
        writer
            .write_all(b"{\"method\":\"done\",\"params\":{}}\n")
            .await
            .unwrap();
        // Give the reader task a chance to enqueue the stale frame.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.run(Utf8Path::new("tests/a.spec"), Vec::new());
        let frame = next_frame(&mut reader).await;
        assert_eq!(frame["method"], "run");

        writer
            .write_all(b"{\"method\":\"done\",\"params\":{\"failedTestId\":\"t9\"}}\n")
            .await
            .unwrap();
        let event = handle.recv().await.unwrap();
        assert!(
            matches!(
                event,
                WorkerEvent::Message(WorkerMessage::Done(ref params))
                    if params.failed_test_id == Some("t9".into())
            ),
            "stale done was drained, got {event:?}"
        );
    }
}
