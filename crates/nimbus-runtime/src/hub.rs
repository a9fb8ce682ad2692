//! The per-worker message hub.
//!
//! Each worker owns one `MessageHub`. Producers accumulate messages into
//! per-destination local lists and transfer them in batches; the only
//! cross-worker state is each hub's incoming list, the lock around it,
//! and the wake flag that elides redundant notifier signals.

use crate::message::{Envelope, MessageList};
use crate::notify::WakeNotifier;
use nimbus_common::{Priority, SchedulerConfig, WorkerId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Incoming queue shared by every producer targeting one worker.
struct IncomingQueue {
    list: MessageList,
    /// True while the destination has an unprocessed wake pending. The
    /// first producer to enqueue after a reset signals the notifier; all
    /// others skip it.
    woken: bool,
    pushes: u64,
}

impl IncomingQueue {
    /// Marks the destination as woken; returns the previous state.
    fn check_and_set_woken(&mut self) -> bool {
        let was_woken = self.woken;
        self.woken = true;
        was_woken
    }
}

/// Cross-worker shared half of one hub.
struct HubShared {
    incoming: Mutex<IncomingQueue>,
    notifier: WakeNotifier,
}

impl HubShared {
    fn new() -> Self {
        Self {
            incoming: Mutex::new(IncomingQueue {
                list: MessageList::new(),
                woken: false,
                pushes: 0,
            }),
            notifier: WakeNotifier::new(),
        }
    }
}

/// Shared handle to every hub's cross-worker surface.
///
/// This is the only way to reach a hub from outside its home worker.
#[derive(Clone)]
pub struct HubRegistry {
    shared: Arc<Vec<HubShared>>,
}

impl HubRegistry {
    /// Creates the shared surfaces for `workers` hubs.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker count must be nonzero");
        Self {
            shared: Arc::new((0..workers).map(|_| HubShared::new()).collect()),
        }
    }

    /// Number of workers this registry serves.
    pub fn worker_count(&self) -> usize {
        self.shared.len()
    }

    /// Enqueues a message onto `dest`'s incoming list from any thread,
    /// signalling the destination's notifier on the wake flag's
    /// false-to-true transition.
    pub fn insert_external_message(&self, dest: WorkerId, env: Envelope) {
        let shared = &self.shared[dest.0];
        let do_wake_up = {
            let mut incoming = shared.incoming.lock();
            let do_wake_up = !incoming.check_and_set_woken();
            incoming.list.push_back(env);
            incoming.pushes += 1;
            do_wake_up
        };

        if do_wake_up {
            shared.notifier.signal();
        }
    }

    /// The wake notifier bound to `dest`'s event loop.
    pub fn notifier(&self, dest: WorkerId) -> &WakeNotifier {
        &self.shared[dest.0].notifier
    }

    /// Number of messages currently queued on `dest`'s incoming list.
    pub fn incoming_len(&self, dest: WorkerId) -> usize {
        self.shared[dest.0].incoming.lock().list.len()
    }

    /// Total enqueues onto `dest`'s incoming list since start.
    pub fn incoming_pushes(&self, dest: WorkerId) -> u64 {
        self.shared[dest.0].incoming.lock().pushes
    }
}

/// Per-hub delivery counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    /// Messages handed to their callbacks.
    pub delivered: u64,
    /// Scheduler passes run across all `on_event` invocations.
    pub passes: u64,
    /// Messages sorted out of the incoming list.
    pub sorted: u64,
    /// Debug-only reloop requeues.
    pub relooped: u64,
}

/// The owner-side message hub of one worker.
///
/// All methods here are owner-only; cross-thread producers go through
/// [`HubRegistry`].
pub struct MessageHub {
    worker: WorkerId,
    config: SchedulerConfig,
    registry: HubRegistry,
    /// One local accumulation list per destination worker.
    local: Vec<MessageList>,
    /// One FIFO lane per priority level.
    lanes: Vec<MessageList>,
    stats: HubStats,
}

impl MessageHub {
    /// Creates the hub for `worker`.
    pub fn new(worker: WorkerId, config: SchedulerConfig, registry: HubRegistry) -> Self {
        assert!(worker.0 < registry.worker_count());
        debug_assert!(config.validate().is_ok());

        let num_priorities = config.num_priorities();
        let honored = 1u64
            .checked_shl(num_priorities as u32 - 1)
            .map_or(false, |needed| config.granularity as u64 >= needed);
        if !honored {
            warn!(
                granularity = config.granularity,
                num_priorities,
                "scheduler granularity is too small to honor some of the lower priorities"
            );
        }

        let workers = registry.worker_count();
        Self {
            worker,
            config,
            registry,
            local: (0..workers).map(|_| MessageList::new()).collect(),
            lanes: (0..num_priorities).map(|_| MessageList::new()).collect(),
            stats: HubStats::default(),
        }
    }

    /// This hub's worker id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Scheduler configuration shared by all hubs of the runtime.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The registry this hub routes through.
    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// Delivery counters for this hub.
    pub fn stats(&self) -> HubStats {
        self.stats
    }

    fn lane_index(&self, priority: Priority) -> usize {
        debug_assert!(priority >= self.config.min_priority);
        debug_assert!(priority <= self.config.max_priority);
        (priority as isize - self.config.min_priority as isize) as usize
    }

    fn do_store_message(&mut self, dest: WorkerId, env: Envelope) {
        assert!(
            dest.0 < self.local.len(),
            "destination {dest} out of range"
        );
        debug_assert!(env.priority() >= self.config.min_priority);
        debug_assert!(env.priority() <= self.config.max_priority);
        self.local[dest.0].push_back(env);
    }

    /// Collects an ordered message for `dest` onto the local list.
    ///
    /// Ordered messages from this hub to one destination are delivered in
    /// enqueue order. Panics if the envelope is already marked ordered:
    /// each envelope can only be enqueued once, and the flag is cleared
    /// when the message is sorted for delivery.
    pub fn store_message_ordered(&mut self, dest: WorkerId, mut env: Envelope) {
        assert!(
            !env.is_ordered(),
            "message is already enqueued as ordered"
        );
        #[cfg(debug_assertions)]
        if self.config.reloop_fuzzing {
            // A default of one reloop lets sometime-messages jump ahead of
            // ordered ones while fuzzing.
            env.set_reloop_count(1);
        }
        env.set_ordered(true);
        self.do_store_message(dest, env);
    }

    /// Collects an unordered message for `dest` onto the local list.
    ///
    /// Unordered messages may be delivered out of enqueue order relative
    /// to each other and to ordered messages.
    pub fn store_message_sometime(&mut self, dest: WorkerId, env: Envelope) {
        #[cfg(debug_assertions)]
        if self.config.reloop_fuzzing {
            let mut env = env;
            env.set_reloop_count(rand_reloop_count());
            self.do_store_message(dest, env);
            return;
        }
        self.do_store_message(dest, env);
    }

    /// Splices each non-empty local list into its destination's incoming
    /// list, signalling destinations whose wake flag transitions.
    ///
    /// Called by the owning worker at yield points; never while `on_event`
    /// is running.
    pub fn push_messages(&mut self) {
        for dest in 0..self.local.len() {
            if self.local[dest].is_empty() {
                continue;
            }

            let shared = &self.registry.shared[dest];
            let do_wake_up = {
                let mut incoming = shared.incoming.lock();
                // Only the first producer since the destination's last
                // reset performs the wake-up.
                let do_wake_up = !incoming.check_and_set_woken();
                incoming.pushes += self.local[dest].len() as u64;
                incoming.list.append_and_clear(&mut self.local[dest]);
                do_wake_up
            };

            if do_wake_up {
                shared.notifier.signal();
            }
        }
    }

    /// Folds this worker's own local list into its own incoming list.
    ///
    /// Needed on later `on_event` passes: `push_messages` is not called
    /// while the handler runs, so self-addressed messages would otherwise
    /// sit in the local list.
    pub(crate) fn deliver_local_messages(&mut self) {
        let own = self.worker.0;
        if self.local[own].is_empty() {
            return;
        }

        let shared = &self.registry.shared[own];
        let do_wake_up = {
            let mut incoming = shared.incoming.lock();
            incoming.pushes += self.local[own].len() as u64;
            incoming.list.append_and_clear(&mut self.local[own]);
            !incoming.check_and_set_woken()
        };
        if do_wake_up {
            // Wake ourselves for another round. The wake flag guarantees
            // at most one pending signal, so this cannot pile up.
            shared.notifier.signal();
        }
    }

    /// Drains the incoming list and distributes messages into priority
    /// lanes.
    ///
    /// An ordered message lands in the ordered lane and its flag is
    /// cleared; from then on its effective priority never reverts. The
    /// wake flag is reset only when `reset_woken` is set, i.e. on the
    /// first pass of `on_event`, so arrivals during later passes trigger a
    /// fresh wake-up.
    pub(crate) fn sort_incoming_messages_by_priority(&mut self, reset_woken: bool) {
        // Pull the messages first; the lock covers only the O(1) splice,
        // the per-message lane assignment happens outside it.
        let mut new_messages = MessageList::new();
        {
            let mut incoming = self.registry.shared[self.worker.0].incoming.lock();
            new_messages.append_and_clear(&mut incoming.list);
            if reset_woken {
                incoming.woken = false;
            }
        }

        while let Some(mut env) = new_messages.pop_front() {
            let effective_priority = if env.is_ordered() {
                // Ordered messages share one lane so none can overtake
                // another.
                env.set_ordered(false);
                self.config.ordered_priority
            } else {
                env.priority()
            };
            self.stats.sorted += 1;
            let lane = self.lane_index(effective_priority);
            self.lanes[lane].push_back(env);
        }
    }

    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub(crate) fn lane_len(&self, lane: usize) -> usize {
        self.lanes[lane].len()
    }

    pub(crate) fn total_pending(&self) -> usize {
        self.lanes.iter().map(MessageList::len).sum()
    }

    pub(crate) fn pop_lane(&mut self, lane: usize) -> Option<Envelope> {
        self.lanes[lane].pop_front()
    }

    /// Requeues a relooped message onto this worker's own local list.
    pub(crate) fn requeue_local(&mut self, env: Envelope) {
        self.stats.relooped += 1;
        let own = self.worker;
        self.do_store_message(own, env);
    }

    pub(crate) fn record_pass(&mut self) {
        self.stats.passes += 1;
    }

    pub(crate) fn record_delivery(&mut self) {
        self.stats.delivered += 1;
    }

    /// Asserts that no message is stranded in this hub.
    ///
    /// Called when a worker retires; a non-empty list here means an
    /// enqueued message would never reach its callback.
    pub fn assert_drained(&self) {
        for (dest, list) in self.local.iter().enumerate() {
            assert!(
                list.is_empty(),
                "hub {} still holds local messages for worker {dest}",
                self.worker
            );
        }
        for (lane, list) in self.lanes.iter().enumerate() {
            assert!(
                list.is_empty(),
                "hub {} still holds sorted messages in lane {lane}",
                self.worker
            );
        }
        assert_eq!(
            self.registry.incoming_len(self.worker),
            0,
            "hub {} still has incoming messages",
            self.worker
        );
    }
}

/// Draws a reloop count with a geometric-like falloff: the probability of
/// `k` halves with each increment.
#[cfg(debug_assertions)]
fn rand_reloop_count() -> u8 {
    use rand::Rng;
    let r: f64 = 1.0 - rand::thread_rng().gen::<f64>();
    let count = (-r.log2()).floor();
    count.clamp(0.0, 16.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerCx;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            min_priority: 0,
            max_priority: 3,
            ordered_priority: 1,
            granularity: 8,
            reloop_fuzzing: false,
        }
    }

    fn noop(priority: Priority) -> Envelope {
        Envelope::new(priority, |_cx: &mut WorkerCx| {})
    }

    fn two_hubs() -> (MessageHub, MessageHub) {
        let registry = HubRegistry::new(2);
        let hub0 = MessageHub::new(WorkerId(0), test_config(), registry.clone());
        let hub1 = MessageHub::new(WorkerId(1), test_config(), registry);
        (hub0, hub1)
    }

    #[test]
    fn test_push_messages_splices_to_destination() {
        let (mut hub0, hub1) = two_hubs();

        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.store_message_sometime(WorkerId(1), noop(2));
        assert_eq!(hub0.registry().incoming_len(WorkerId(1)), 0);

        hub0.push_messages();

        assert_eq!(hub0.registry().incoming_len(WorkerId(1)), 2);
        assert_eq!(hub0.registry().incoming_pushes(WorkerId(1)), 2);
        assert_eq!(hub1.registry().notifier(WorkerId(1)).signals_sent(), 1);
    }

    #[test]
    fn test_push_messages_elides_second_wake() {
        let (mut hub0, _hub1) = two_hubs();

        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.push_messages();
        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.push_messages();

        // The second batch found the wake flag already set.
        assert_eq!(hub0.registry().notifier(WorkerId(1)).signals_sent(), 1);
        assert_eq!(hub0.registry().incoming_len(WorkerId(1)), 2);
    }

    #[test]
    fn test_sort_assigns_ordered_lane() {
        let (mut hub0, mut hub1) = two_hubs();

        let mut high = noop(3);
        high.set_ordered(true);
        hub0.do_store_message(WorkerId(1), high);
        hub0.store_message_sometime(WorkerId(1), noop(3));
        hub0.push_messages();

        hub1.sort_incoming_messages_by_priority(true);

        // Ordered message landed in lane 1 (the ordered priority), the
        // unordered one kept its own priority.
        assert_eq!(hub1.lane_len(1), 1);
        assert_eq!(hub1.lane_len(3), 1);

        let sorted = hub1.pop_lane(1).unwrap();
        assert!(!sorted.is_ordered());
        hub1.pop_lane(3).unwrap();
    }

    #[test]
    fn test_sort_resets_wake_flag_on_first_pass_only() {
        let (mut hub0, mut hub1) = two_hubs();

        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.push_messages();
        hub1.sort_incoming_messages_by_priority(true);

        // Flag was reset, so a new producer signals again.
        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.push_messages();
        assert_eq!(hub1.registry().notifier(WorkerId(1)).signals_sent(), 2);

        // A non-resetting sort leaves the flag set; the next push elides.
        hub1.sort_incoming_messages_by_priority(false);
        hub0.store_message_sometime(WorkerId(1), noop(0));
        hub0.push_messages();
        assert_eq!(hub1.registry().notifier(WorkerId(1)).signals_sent(), 2);

        while hub1.pop_lane(0).is_some() {}
        hub1.sort_incoming_messages_by_priority(true);
        while hub1.pop_lane(0).is_some() {}
    }

    #[test]
    #[should_panic(expected = "already enqueued as ordered")]
    fn test_double_ordered_enqueue_is_fatal() {
        let (mut hub0, _hub1) = two_hubs();
        let mut env = noop(0);
        env.set_ordered(true);
        hub0.store_message_ordered(WorkerId(1), env);
    }

    #[test]
    fn test_deliver_local_messages_self_wakes() {
        let (_hub0, mut hub1) = two_hubs();

        hub1.store_message_sometime(WorkerId(1), noop(0));
        hub1.deliver_local_messages();

        assert_eq!(hub1.registry().incoming_len(WorkerId(1)), 1);
        assert_eq!(hub1.registry().notifier(WorkerId(1)).signals_sent(), 1);

        hub1.sort_incoming_messages_by_priority(true);
        assert!(hub1.pop_lane(0).is_some());
    }

    #[test]
    fn test_external_insert_coalesces_wakes() {
        let registry = HubRegistry::new(2);
        for _ in 0..10 {
            registry.insert_external_message(WorkerId(1), noop(0));
        }

        assert_eq!(registry.incoming_len(WorkerId(1)), 10);
        assert_eq!(registry.incoming_pushes(WorkerId(1)), 10);
        assert_eq!(registry.notifier(WorkerId(1)).signals_sent(), 1);
    }

    #[test]
    fn test_assert_drained_passes_when_empty() {
        let (hub0, _hub1) = two_hubs();
        hub0.assert_drained();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_rand_reloop_count_in_range() {
        for _ in 0..1000 {
            assert!(rand_reloop_count() <= 16);
        }
    }
}
