//! Tracer representation.
//!
//! A tracer is one timed, possibly nested operation inside an activity.
//! Tracers form a tree (parent points at the enclosing stack entry) and are
//! arena-allocated in their activity, so a token is just an index. The
//! closed set of variants below replaces a polymorphic tracer hierarchy;
//! behavior differences are dispatched on the tag.

use std::time::Instant;
use ustr::Ustr;

/// The closed set of tracer variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracerKind {
    /// First tracer of a transaction's root activity.
    Root,
    /// Nested under another tracer on the same stack.
    Child,
    /// First tracer of a detached async activity.
    AsyncRoot,
}

/// Handle to a started tracer. A sentinel token is handed out once the
/// stack depth limit is hit; finishing it is a no-op, so over-deep
/// instrumentation degrades silently instead of erroring on the hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracerToken {
    pub(crate) index: usize,
    pub(crate) sentinel: bool,
}

impl TracerToken {
    pub(crate) fn live(index: usize) -> Self {
        TracerToken {
            index,
            sentinel: false,
        }
    }

    pub(crate) fn sentinel() -> Self {
        TracerToken {
            index: usize::MAX,
            sentinel: true,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }
}

#[derive(Debug)]
pub(crate) struct TracerData {
    pub kind: TracerKind,
    pub metric_name: Ustr,
    pub parent: Option<usize>,
    pub start: Instant,
    pub duration_nanos: u64,
    /// Sum of direct children's durations, accumulated as they finish.
    pub children_duration_nanos: u64,
    pub finished: bool,
}

impl TracerData {
    pub fn new(kind: TracerKind, metric_name: Ustr, parent: Option<usize>, start: Instant) -> Self {
        TracerData {
            kind,
            metric_name,
            parent,
            start,
            duration_nanos: 0,
            children_duration_nanos: 0,
            finished: false,
        }
    }

    /// Exclusive time is own duration minus direct children, floored at
    /// zero: overlapping concurrent children can sum past the parent's wall
    /// time and must not go negative.
    pub fn exclusive_nanos(&self) -> u64 {
        self.duration_nanos
            .saturating_sub(self.children_duration_nanos)
    }
}
