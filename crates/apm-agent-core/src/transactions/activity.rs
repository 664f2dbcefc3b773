//! The per-segment tracer call stack.
//!
//! An activity is owned by exactly one execution context at a time, so the
//! start/finish hot path takes `&mut self` and needs no locks. Misuse from
//! the instrumentation layer (finishing a tracer that is not the top of the
//! stack, finishing twice) is logged and ignored; it must never take the
//! host application down.

use crate::stats::TransactionStats;
use crate::transactions::tracer::{TracerData, TracerKind, TracerToken};
use std::time::Instant;
use tracing::{debug, warn};
use ustr::Ustr;

pub struct Activity {
    id: u64,
    async_root: bool,
    max_stack_depth: usize,
    tracers: Vec<TracerData>,
    stack: Vec<usize>,
    stats: TransactionStats,
    root_duration_nanos: u64,
    finished: bool,
}

impl Activity {
    pub(crate) fn new(id: u64, max_stack_depth: usize, async_root: bool) -> Self {
        Activity {
            id,
            async_root,
            max_stack_depth,
            tracers: Vec::new(),
            stack: Vec::new(),
            stats: TransactionStats::new(),
            root_duration_nanos: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wall time of the root tracer, available once it has finished.
    pub fn duration_nanos(&self) -> u64 {
        self.root_duration_nanos
    }

    /// Pushes a tracer onto the stack and returns its token. Once the depth
    /// limit is reached the returned token is a sentinel and nothing is
    /// recorded; the caller cannot tell the difference and does not need to.
    pub fn tracer_started(&mut self, metric_name: &str) -> TracerToken {
        self.start_internal(metric_name, Instant::now())
    }

    fn start_internal(&mut self, metric_name: &str, now: Instant) -> TracerToken {
        if self.finished {
            warn!("tracer_started on finished activity {}; ignoring", self.id);
            return TracerToken::sentinel();
        }
        if self.stack.len() >= self.max_stack_depth {
            debug!(
                "Tracer stack depth limit ({}) reached on activity {}; returning sentinel",
                self.max_stack_depth, self.id
            );
            return TracerToken::sentinel();
        }

        let kind = if self.stack.is_empty() {
            if self.async_root {
                TracerKind::AsyncRoot
            } else {
                TracerKind::Root
            }
        } else {
            TracerKind::Child
        };
        let parent = self.stack.last().copied();
        let index = self.tracers.len();
        self.tracers
            .push(TracerData::new(kind, Ustr::from(metric_name), parent, now));
        self.stack.push(index);
        TracerToken::live(index)
    }

    /// Pops the finished tracer off the stack, computing its duration and
    /// exclusive time and recording them into the activity's scratch stats.
    /// Rejects (logs, does not error) a tracer that is not the current top:
    /// that is instrumentation misuse in the caller.
    pub fn tracer_finished(&mut self, token: TracerToken) {
        self.finish_internal(token, Instant::now());
    }

    fn finish_internal(&mut self, token: TracerToken, now: Instant) {
        if token.is_sentinel() {
            return;
        }
        match self.stack.last() {
            Some(&top) if top == token.index => {}
            _ => {
                warn!(
                    "tracer_finished out of order on activity {}: tracer {} is not the top of the stack",
                    self.id, token.index
                );
                return;
            }
        }
        self.stack.pop();

        let (duration_nanos, exclusive_nanos, parent, metric_name) = {
            let data = &mut self.tracers[token.index];
            data.duration_nanos = now.saturating_duration_since(data.start).as_nanos() as u64;
            data.finished = true;
            (
                data.duration_nanos,
                data.exclusive_nanos(),
                data.parent,
                data.metric_name,
            )
        };
        if let Some(parent) = parent {
            self.tracers[parent].children_duration_nanos += duration_nanos;
        }

        self.stats
            .scoped_mut(metric_name)
            .record_response_time_nanos(duration_nanos, exclusive_nanos);

        if self.stack.is_empty() {
            self.root_duration_nanos = duration_nanos;
        }
    }

    /// Token of the tracer currently on top of the stack.
    pub fn last_tracer(&self) -> Option<TracerToken> {
        self.stack.last().map(|&index| TracerToken::live(index))
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Records an unscoped metric against this activity (rollups, client
    /// application metrics).
    pub fn record_unscoped_response_time(&mut self, name: Ustr, duration_nanos: u64) {
        self.stats
            .unscoped_mut(name)
            .record_response_time_nanos(duration_nanos, duration_nanos);
    }

    /// Marks the activity finished. Finishing twice is a no-op that logs a
    /// warning. Tracers still on the stack at finish time are abandoned.
    pub fn finish(&mut self) -> bool {
        if self.finished {
            warn!("Activity {} finished twice; ignoring", self.id);
            return false;
        }
        if !self.stack.is_empty() {
            debug!(
                "Activity {} finished with {} unfinished tracers on the stack",
                self.id,
                self.stack.len()
            );
            self.stack.clear();
        }
        self.finished = true;
        true
    }

    pub(crate) fn take_stats(&mut self) -> TransactionStats {
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;
    use ustr::ustr;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_nested_tracers_compute_exclusive_time() {
        let t0 = Instant::now();
        let mut activity = Activity::new(1, 100, false);

        let root = activity.start_internal("root", t0);
        let child = activity.start_internal("child", t0 + ms(10));
        activity.finish_internal(child, t0 + ms(40));
        activity.finish_internal(root, t0 + ms(100));

        let stats = activity.take_stats();
        let (_, scoped) = stats.into_parts();

        let root_stats = &scoped[&ustr("root")];
        assert_eq!(root_stats.count, 1);
        // Root total 100ms, child took 30ms, so 70ms exclusive.
        assert!((root_stats.total - 0.100).abs() < 1e-6);
        assert!((root_stats.exclusive - 0.070).abs() < 1e-6);

        let child_stats = &scoped[&ustr("child")];
        assert!((child_stats.total - 0.030).abs() < 1e-6);
        assert!((child_stats.exclusive - 0.030).abs() < 1e-6);
    }

    #[test]
    fn test_overlapping_children_floor_exclusive_at_zero() {
        // Children whose recorded durations overlap can exceed the parent's
        // wall time; exclusive time must clamp to zero, not go negative.
        let t0 = Instant::now();
        let mut activity = Activity::new(1, 100, false);

        let root = activity.start_internal("root", t0);
        let a = activity.start_internal("a", t0);
        activity.finish_internal(a, t0 + ms(80));
        let b = activity.start_internal("b", t0);
        activity.finish_internal(b, t0 + ms(90));
        activity.finish_internal(root, t0 + ms(100));

        let stats = activity.take_stats();
        let (_, scoped) = stats.into_parts();
        let root_stats = &scoped[&ustr("root")];
        assert_eq!(root_stats.exclusive, 0.0);
        assert!((root_stats.total - 0.100).abs() < 1e-6);
    }

    #[traced_test]
    #[test]
    fn test_mismatched_pop_is_logged_noop() {
        let t0 = Instant::now();
        let mut activity = Activity::new(7, 100, false);

        let root = activity.start_internal("root", t0);
        let _child = activity.start_internal("child", t0);
        // Finishing the root while the child is still open is a misuse.
        activity.finish_internal(root, t0 + ms(5));

        assert_eq!(activity.stack_depth(), 2);
        assert!(logs_contain("out of order"));
    }

    #[test]
    fn test_depth_limit_returns_sentinel() {
        let t0 = Instant::now();
        let mut activity = Activity::new(1, 2, false);
        let a = activity.start_internal("a", t0);
        let b = activity.start_internal("b", t0);
        let over = activity.start_internal("over", t0);

        assert!(over.is_sentinel());
        assert_eq!(activity.stack_depth(), 2);

        // Finishing a sentinel is a silent no-op.
        activity.finish_internal(over, t0 + ms(1));
        activity.finish_internal(b, t0 + ms(1));
        activity.finish_internal(a, t0 + ms(2));
        assert_eq!(activity.stack_depth(), 0);
    }

    #[traced_test]
    #[test]
    fn test_double_finish_is_noop_with_warning() {
        let mut activity = Activity::new(3, 100, false);
        assert!(activity.finish());
        assert!(!activity.finish());
        assert!(logs_contain("finished twice"));
    }

    #[test]
    fn test_tracer_kinds() {
        let t0 = Instant::now();
        let mut activity = Activity::new(1, 10, false);
        let root = activity.start_internal("root", t0);
        let child = activity.start_internal("child", t0);
        assert_eq!(activity.tracers[root.index].kind, TracerKind::Root);
        assert_eq!(activity.tracers[child.index].kind, TracerKind::Child);

        let mut async_activity = Activity::new(2, 10, true);
        let async_root = async_activity.start_internal("task", t0);
        assert_eq!(
            async_activity.tracers[async_root.index].kind,
            TracerKind::AsyncRoot
        );
    }
}
