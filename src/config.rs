// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dispatcher configuration.
//!
//! The dispatcher is a library and receives its configuration
//! programmatically. [`DispatcherConfig`] carries the resolved values the
//! dispatcher consumes: the worker-pool bound, the fail-fast threshold, the
//! worker entry point, and the serialized loader image forwarded verbatim to
//! every worker's `init` message.

use camino::Utf8PathBuf;
use serde_json::Value;

/// Environment variable holding the worker's index, set on every spawned
/// worker process.
pub const WORKER_INDEX_ENV: &str = "TEST_WORKER_INDEX";

/// Environment variable that, when set to a non-empty value other than `0`,
/// routes worker stderr to the parent's stderr instead of discarding it.
pub const DISPATCHER_DEBUG_ENV: &str = "TEST_DISPATCHER_DEBUG";

/// The command used to start a worker process.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    /// The worker entry-point program.
    pub program: Utf8PathBuf,

    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Creates a new worker command with no arguments.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// The maximum number of live worker processes. Always at least 1.
    pub workers: usize,

    /// The number of unexpected failures after which the run is stopped.
    ///
    /// `0` disables fail-fast regardless of the failure count.
    pub max_failures: usize,

    /// The command used to start worker processes.
    pub worker_command: WorkerCommand,

    /// The serialized loader image, forwarded verbatim in every worker's
    /// `init` message. Opaque to the dispatcher.
    pub loader: Value,

    /// Whether worker stderr is passed through to the parent's stderr.
    ///
    /// Defaults from [`DISPATCHER_DEBUG_ENV`].
    pub forward_worker_stderr: bool,
}

impl DispatcherConfig {
    /// Creates a new configuration.
    ///
    /// `workers` is clamped to at least 1. The loader image defaults to
    /// `null` and stderr passthrough defaults from the environment.
    pub fn new(workers: usize, max_failures: usize, worker_command: WorkerCommand) -> Self {
        Self {
            workers: workers.max(1),
            max_failures,
            worker_command,
            loader: Value::Null,
            forward_worker_stderr: debug_env_enabled(),
        }
    }

    /// Sets the serialized loader image.
    pub fn with_loader(mut self, loader: Value) -> Self {
        self.loader = loader;
        self
    }
}

fn debug_env_enabled() -> bool {
    std::env::var(DISPATCHER_DEBUG_ENV)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_clamped_to_one() {
        let config = DispatcherConfig::new(0, 0, WorkerCommand::new("/bin/true"));
        assert_eq!(config.workers, 1, "zero workers is clamped");
    }

    #[test]
    fn worker_command_args() {
        let command = WorkerCommand::new("/bin/sh").arg("-c").arg("exit 0");
        assert_eq!(command.program, "/bin/sh");
        assert_eq!(command.args, ["-c", "exit 0"]);
    }
}
