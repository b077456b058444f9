// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The work queue: an ordered sequence of enqueued groups.
//!
//! Groups are claimed from the front. Retried and partially-completed groups
//! are re-enqueued at the front, so their tests are preferred over fresh
//! groups on the next dispatch pass.

use crate::list::{TestGroup, TestId};
use camino::Utf8PathBuf;
use smol_str::SmolStr;
use std::{cell::RefCell, collections::VecDeque};

/// A group as held on the queue: the original group's metadata plus the
/// ordered ids of the tests still to run.
#[derive(Clone, Debug)]
pub(super) struct QueuedGroup {
    pub(super) worker_hash: SmolStr,
    pub(super) require_file: Utf8PathBuf,
    pub(super) repeat_each_index: u32,
    pub(super) project_index: u32,
    pub(super) test_ids: Vec<TestId>,
}

impl QueuedGroup {
    pub(super) fn from_group(group: &TestGroup) -> Self {
        Self {
            worker_hash: group.worker_hash.clone(),
            require_file: group.require_file.clone(),
            repeat_each_index: group.repeat_each_index,
            project_index: group.project_index,
            test_ids: group.tests.iter().map(|test| test.id.clone()).collect(),
        }
    }

    /// Builds the re-injection group: same metadata, remaining tests.
    pub(super) fn with_tests(&self, test_ids: Vec<TestId>) -> Self {
        Self {
            worker_hash: self.worker_hash.clone(),
            require_file: self.require_file.clone(),
            repeat_each_index: self.repeat_each_index,
            project_index: self.project_index,
            test_ids,
        }
    }
}

#[derive(Debug)]
pub(super) struct WorkQueue {
    groups: RefCell<VecDeque<QueuedGroup>>,
}

impl WorkQueue {
    pub(super) fn new(groups: Vec<QueuedGroup>) -> Self {
        Self {
            groups: RefCell::new(groups.into()),
        }
    }

    pub(super) fn pop_front(&self) -> Option<QueuedGroup> {
        self.groups.borrow_mut().pop_front()
    }

    pub(super) fn push_front(&self, group: QueuedGroup) {
        self.groups.borrow_mut().push_front(group);
    }

    pub(super) fn is_empty(&self) -> bool {
        self.groups.borrow().is_empty()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(super) fn len(&self) -> usize {
        self.groups.borrow().len()
    }
}
