//! The transaction: naming, activity ownership and finalization.

use crate::config::AgentConfig;
use crate::stats::{StatsService, TransactionStats};
use crate::transactions::Activity;
use crate::util::generate_guid;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};
use ustr::{ustr, Ustr};

const UNNAMED_TRANSACTION: &str = "OtherTransaction/unknown";

/// Priority-ordered transaction naming. A later name wins only with a
/// strictly higher priority; every accepted name is retained in order.
#[derive(Debug, Default)]
struct PriorityTransactionName {
    name: Option<Ustr>,
    priority: i32,
    frozen: bool,
    history: Vec<Ustr>,
}

impl PriorityTransactionName {
    fn set(&mut self, name: &str, priority: i32) -> bool {
        if self.frozen {
            debug!("Transaction name frozen; ignoring rename to {}", name);
            return false;
        }
        if self.name.is_some() && priority <= self.priority {
            return false;
        }
        let name = ustr(name);
        self.name = Some(name);
        self.priority = priority;
        self.history.push(name);
        true
    }

    fn resolved(&self) -> Ustr {
        self.name.unwrap_or_else(|| ustr(UNNAMED_TRANSACTION))
    }
}

struct TransactionInner {
    guid: String,
    app_name: String,
    start: Instant,
    name: PriorityTransactionName,
    sampling_priority: f32,
    queue_time_millis: u64,
    ignored: bool,
    finished: bool,
    next_activity_id: u64,
    max_stack_depth: usize,
    /// Scratch stats of finished activities plus transaction-level metrics,
    /// merged into the shared engine exactly once at finalization.
    collected: TransactionStats,
    root_duration_nanos: u64,
}

/// One logical unit of monitored work. Cheap to clone; all clones share the
/// same state. The lock is held only for short field accesses, never across
/// tracer work or I/O.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<TransactionInner>>,
}

#[allow(clippy::expect_used)]
impl Transaction {
    pub fn start(config: &Arc<AgentConfig>) -> Self {
        Transaction {
            inner: Arc::new(Mutex::new(TransactionInner {
                guid: generate_guid(),
                app_name: config.app_name.clone(),
                start: Instant::now(),
                name: PriorityTransactionName::default(),
                sampling_priority: rand::random::<f32>(),
                queue_time_millis: 0,
                ignored: false,
                finished: false,
                next_activity_id: 0,
                max_stack_depth: config.max_stack_depth,
                collected: TransactionStats::new(),
                root_duration_nanos: 0,
            })),
        }
    }

    pub fn guid(&self) -> String {
        self.inner.lock().expect("lock poisoned").guid.clone()
    }

    pub fn app_name(&self) -> String {
        self.inner.lock().expect("lock poisoned").app_name.clone()
    }

    /// Starts a new activity for this transaction. The first activity is
    /// the root; the caller owns the returned value and hands it back via
    /// [`Transaction::activity_finished`].
    pub fn start_activity(&self) -> Activity {
        self.new_activity(false)
    }

    /// Starts a detached activity modeling an asynchronous continuation. It
    /// runs on its own stack and merges back at finalization.
    pub fn start_async_activity(&self) -> Activity {
        self.new_activity(true)
    }

    fn new_activity(&self, async_root: bool) -> Activity {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let id = inner.next_activity_id;
        inner.next_activity_id += 1;
        Activity::new(id, inner.max_stack_depth, async_root)
    }

    /// Collects a finished activity's recorded data. Finishes the activity
    /// first if the caller has not already done so.
    pub fn activity_finished(&self, mut activity: Activity) {
        if !activity.is_finished() {
            activity.finish();
        }
        let stats = activity.take_stats();
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.finished {
            warn!(
                "Activity {} finished after its transaction {}; data discarded",
                activity.id(),
                inner.guid
            );
            return;
        }
        inner.collected.merge(stats);
        if activity.id() == 0 {
            inner.root_duration_nanos = activity.duration_nanos();
        }
    }

    /// Renames the transaction; only a strictly higher priority wins.
    pub fn set_name(&self, name: &str, priority: i32) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.name.set(name, priority)
    }

    /// Locks the name against further renames (done before the name escapes
    /// to the outside, e.g. on an outbound CAT response header).
    pub fn freeze_name(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.name.frozen = true;
    }

    pub fn name(&self) -> Ustr {
        self.inner.lock().expect("lock poisoned").name.resolved()
    }

    /// Every name this transaction was ever assigned, in acceptance order.
    pub fn name_history(&self) -> Vec<Ustr> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .name
            .history
            .clone()
    }

    pub fn sampling_priority(&self) -> f32 {
        self.inner.lock().expect("lock poisoned").sampling_priority
    }

    pub fn set_sampling_priority(&self, priority: f32) {
        self.inner.lock().expect("lock poisoned").sampling_priority = priority;
    }

    pub fn set_ignore(&self, ignore: bool) {
        self.inner.lock().expect("lock poisoned").ignored = ignore;
    }

    pub fn is_ignored(&self) -> bool {
        self.inner.lock().expect("lock poisoned").ignored
    }

    pub fn set_queue_time_millis(&self, millis: u64) {
        self.inner.lock().expect("lock poisoned").queue_time_millis = millis;
    }

    pub fn queue_time_millis(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").queue_time_millis
    }

    /// Wall time since the transaction started.
    pub fn running_duration_nanos(&self) -> u64 {
        let inner = self.inner.lock().expect("lock poisoned");
        Instant::now().saturating_duration_since(inner.start).as_nanos() as u64
    }

    /// Root activity duration, available once the root activity finished.
    pub fn duration_nanos(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").root_duration_nanos
    }

    /// Records a transaction-level unscoped metric (client application
    /// metrics, rollups).
    pub fn record_unscoped_response_time(&self, name: Ustr, duration_nanos: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner
            .collected
            .unscoped_mut(name)
            .record_response_time_nanos(duration_nanos, duration_nanos);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().expect("lock poisoned").finished
    }

    /// Finalizes the transaction exactly once: freezes the name and merges
    /// everything the activities recorded into the shared engine under the
    /// final name. An ignored transaction discards its data. Returns false
    /// (with a warning) on a second finish.
    pub fn finish(&self, stats: &StatsService) -> bool {
        let (app_name, collected, scope) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.finished {
                warn!("Transaction {} finished twice; ignoring", inner.guid);
                return false;
            }
            inner.finished = true;
            inner.name.frozen = true;
            if inner.ignored {
                debug!("Transaction {} ignored; discarding recorded data", inner.guid);
                return true;
            }
            (
                inner.app_name.clone(),
                std::mem::take(&mut inner.collected),
                inner.name.resolved(),
            )
        };
        // The merge itself happens outside the transaction lock; the stats
        // service serializes on the per-app engine only.
        stats.merge_transaction_stats(&app_name, collected, scope);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MetricId;
    use tracing_test::traced_test;

    fn config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            app_name: "test-app".to_string(),
            ..AgentConfig::default()
        })
    }

    #[test]
    fn test_priority_naming_is_monotonic() {
        let tx = Transaction::start(&config());
        assert!(tx.set_name("WebTransaction/A", 1));
        assert!(!tx.set_name("WebTransaction/lower", 0));
        assert!(!tx.set_name("WebTransaction/equal", 1));
        assert!(tx.set_name("WebTransaction/B", 5));
        assert_eq!(tx.name().as_str(), "WebTransaction/B");
        assert_eq!(
            tx.name_history()
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>(),
            vec!["WebTransaction/A", "WebTransaction/B"]
        );
    }

    #[test]
    fn test_frozen_name_rejects_renames() {
        let tx = Transaction::start(&config());
        tx.set_name("WebTransaction/A", 1);
        tx.freeze_name();
        assert!(!tx.set_name("WebTransaction/B", 10));
        assert_eq!(tx.name().as_str(), "WebTransaction/A");
    }

    #[test]
    fn test_rename_after_recording_lands_under_final_name() {
        let stats = StatsService::new();
        let tx = Transaction::start(&config());
        tx.set_name("WebTransaction/A", 1);

        let mut activity = tx.start_activity();
        let root = activity.tracer_started("Segment/root");
        let child = activity.tracer_started("Segment/db");
        activity.tracer_finished(child);
        activity.tracer_finished(root);
        tx.activity_finished(activity);

        // Higher-priority rename after the tracers already recorded data.
        tx.set_name("WebTransaction/B", 5);
        assert!(tx.finish(&stats));

        let engine = stats.harvest("test-app");
        let under_b = MetricId::scoped(ustr("Segment/db"), ustr("WebTransaction/B"));
        assert!(engine.get(&under_b).is_some());
        let under_a = MetricId::scoped(ustr("Segment/db"), ustr("WebTransaction/A"));
        assert!(engine.get(&under_a).is_none());
    }

    #[test]
    fn test_async_activity_merges_at_finalization() {
        let stats = StatsService::new();
        let tx = Transaction::start(&config());
        tx.set_name("OtherTransaction/job", 1);

        let mut root = tx.start_activity();
        let tracer = root.tracer_started("Segment/main");
        activity_work(&mut root);
        root.tracer_finished(tracer);
        tx.activity_finished(root);

        let mut detached = tx.start_async_activity();
        let tracer = detached.tracer_started("Segment/async");
        detached.tracer_finished(tracer);
        tx.activity_finished(detached);

        tx.finish(&stats);
        let engine = stats.harvest("test-app");
        assert!(engine
            .get(&MetricId::scoped(
                ustr("Segment/main"),
                ustr("OtherTransaction/job")
            ))
            .is_some());
        assert!(engine
            .get(&MetricId::scoped(
                ustr("Segment/async"),
                ustr("OtherTransaction/job")
            ))
            .is_some());
    }

    fn activity_work(activity: &mut Activity) {
        let inner = activity.tracer_started("Segment/inner");
        activity.tracer_finished(inner);
    }

    #[traced_test]
    #[test]
    fn test_finish_is_exactly_once() {
        let stats = StatsService::new();
        let tx = Transaction::start(&config());
        assert!(tx.finish(&stats));
        assert!(!tx.finish(&stats));
        assert!(logs_contain("finished twice"));
    }

    #[test]
    fn test_ignored_transaction_discards_data() {
        let stats = StatsService::new();
        let tx = Transaction::start(&config());
        let mut activity = tx.start_activity();
        let tracer = activity.tracer_started("Segment/x");
        activity.tracer_finished(tracer);
        tx.activity_finished(activity);

        tx.set_ignore(true);
        assert!(tx.finish(&stats));
        assert!(stats.harvest("test-app").is_empty());
    }

    #[test]
    fn test_guid_is_stable_across_clones() {
        let tx = Transaction::start(&config());
        let clone = tx.clone();
        assert_eq!(tx.guid(), clone.guid());
    }
}
