// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions, activities and the tracer call stack.
//!
//! A transaction is one logical unit of monitored work. Each thread-of-
//! execution segment of it is an [`Activity`] holding a stack of nested
//! timed tracers; asynchronous continuations get their own detached
//! activity that merges back at finalization. Nothing on the tracer hot
//! path blocks: per-activity state is unsynchronized and owned by the
//! caller, and the only shared critical section is the stats merge when the
//! transaction finishes.
//!
//! There is no implicit thread-local "current activity". Instrumentation
//! owns an [`ActivityBinding`] per execution context and moves activities
//! in and out of it explicitly, which makes cross-thread hand-off an
//! ownership transfer instead of a side effect.

pub mod activity;
pub mod tracer;
pub mod transaction;

pub use activity::Activity;
pub use tracer::{TracerKind, TracerToken};
pub use transaction::Transaction;

use tracing::warn;

/// An explicit one-slot holder for the current activity of an execution
/// context. At most one activity is bound at a time; binding over an
/// occupied slot displaces (and returns) the previous occupant so the
/// caller decides its fate.
#[derive(Default)]
pub struct ActivityBinding {
    current: Option<Activity>,
}

impl ActivityBinding {
    pub fn new() -> Self {
        ActivityBinding::default()
    }

    /// Binds an activity, returning the displaced one if the slot was
    /// occupied. Displacement signals instrumentation misuse and is logged.
    pub fn bind(&mut self, activity: Activity) -> Option<Activity> {
        let displaced = self.current.replace(activity);
        if displaced.is_some() {
            warn!("Binding over an already-bound activity; displacing the previous one");
        }
        displaced
    }

    /// Takes the bound activity out of the slot, transferring ownership to
    /// the caller (the detach half of a cross-thread hand-off).
    pub fn unbind(&mut self) -> Option<Activity> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&Activity> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Activity> {
        self.current.as_mut()
    }

    pub fn is_bound(&self) -> bool {
        self.current.is_some()
    }
}
