// Copyright (c) The test-dispatcher Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatcher.
//!
//! The main structure in this module is [`Dispatcher`].

mod imp;
mod job;
mod pool;
mod queue;
mod registry;
mod worker;

pub use imp::*;
