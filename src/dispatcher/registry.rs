// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The result registry: owns every enqueued test and its results.
//!
//! The result currently being written to is always the last element of a
//! test's `results`. Starting a retry appends a fresh blank result, so event
//! handlers never write into an earlier attempt.

use crate::{
    errors::DispatchError,
    list::{TestCase, TestId, TestResult},
};
use std::{cell::RefCell, collections::HashMap};

#[derive(Debug)]
pub(super) struct TestRegistry {
    tests: RefCell<HashMap<TestId, TestCase>>,
    // Registration order, for handing results back in a stable order.
    order: Vec<TestId>,
}

impl TestRegistry {
    pub(super) fn new() -> Self {
        Self {
            tests: RefCell::new(HashMap::new()),
            order: Vec::new(),
        }
    }

    /// Registers a test, seeding its first blank result.
    pub(super) fn insert(&mut self, mut test: TestCase) -> Result<(), DispatchError> {
        let id = test.id.clone();
        test.results.push(TestResult::new());
        let mut tests = self.tests.borrow_mut();
        if tests.contains_key(&id) {
            return Err(DispatchError::DuplicateTestId { id });
        }
        tests.insert(id.clone(), test);
        self.order.push(id);
        Ok(())
    }

    /// Runs `f` against the test with the given id, or returns `None` if the
    /// id is unknown.
    pub(super) fn with<T>(&self, id: &TestId, f: impl FnOnce(&mut TestCase) -> T) -> Option<T> {
        self.tests.borrow_mut().get_mut(id).map(f)
    }

    /// The number of results (attempts, current included) for a test.
    pub(super) fn result_count(&self, id: &TestId) -> usize {
        self.tests
            .borrow()
            .get(id)
            .map(|test| test.results.len())
            .unwrap_or(0)
    }

    /// Hands back all tests in registration order.
    pub(super) fn into_tests(self) -> Vec<TestCase> {
        let mut tests = self.tests.into_inner();
        self.order
            .iter()
            .filter_map(|id| tests.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::TestStatus;

    #[test]
    fn insert_seeds_one_blank_result() {
        let mut registry = TestRegistry::new();
        registry
            .insert(TestCase::new("t1", TestStatus::Passed))
            .unwrap();
        assert_eq!(registry.result_count(&"t1".into()), 1);
        registry
            .with(&"t1".into(), |test| {
                assert_eq!(test.results[0].status, TestStatus::Skipped);
            })
            .unwrap();
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = TestRegistry::new();
        registry
            .insert(TestCase::new("t1", TestStatus::Passed))
            .unwrap();
        let err = registry
            .insert(TestCase::new("t1", TestStatus::Failed))
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateTestId { .. }));
    }

    #[test]
    fn retry_rebinds_the_current_result() {
        let mut registry = TestRegistry::new();
        registry
            .insert(TestCase::new("t1", TestStatus::Passed))
            .unwrap();
        registry
            .with(&"t1".into(), |test| {
                test.current_result_mut().status = TestStatus::Failed;
                test.results.push(TestResult::new());
            })
            .unwrap();
        registry
            .with(&"t1".into(), |test| {
                // Writes now land in the fresh result; the failed attempt is
                // untouched.
                test.current_result_mut().status = TestStatus::Passed;
                assert_eq!(test.results[0].status, TestStatus::Failed);
                assert_eq!(test.results[1].status, TestStatus::Passed);
            })
            .unwrap();
        assert_eq!(registry.result_count(&"t1".into()), 2);
    }

    #[test]
    fn into_tests_preserves_registration_order() {
        let mut registry = TestRegistry::new();
        for id in ["t3", "t1", "t2"] {
            registry
                .insert(TestCase::new(id, TestStatus::Passed))
                .unwrap();
        }
        let ids: Vec<_> = registry
            .into_tests()
            .into_iter()
            .map(|test| test.id.as_str().to_owned())
            .collect();
        assert_eq!(ids, ["t3", "t1", "t2"]);
    }
}
