// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the dispatcher.

use crate::list::TestId;
use std::{error, fmt, io};

/// An error that occurred while dispatching test groups to workers.
///
/// Failures reported by the workers themselves (test failures, fatal errors,
/// unexpected exits) never surface as `DispatchError`s: they are folded into
/// test results and reporter callbacks. This type covers the few conditions
/// that prevent dispatching from proceeding at all.
#[derive(Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// A worker process could not be spawned.
    WorkerSpawn {
        /// The index the worker would have been assigned.
        index: u32,
        /// The underlying I/O error.
        error: io::Error,
    },

    /// The same test id was found in more than one enqueued group.
    DuplicateTestId {
        /// The offending test id.
        id: TestId,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::WorkerSpawn { index, .. } => {
                write!(f, "failed to spawn worker process {index}")
            }
            DispatchError::DuplicateTestId { id } => {
                write!(f, "test `{id}` appears in more than one enqueued group")
            }
        }
    }
}

impl error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            DispatchError::WorkerSpawn { error, .. } => Some(error),
            DispatchError::DuplicateTestId { .. } => None,
        }
    }
}
