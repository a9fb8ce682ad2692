//! Worker context and event loop.

use crate::hub::{HubRegistry, MessageHub};
use nimbus_common::{SchedulerConfig, WorkerId};
use std::cell::Cell;

thread_local! {
    /// Worker id of the thread currently running a worker loop.
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Returns the id of the worker running on this thread, if any.
pub fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// One worker's execution context: its hub plus loop control.
///
/// A `WorkerCx` is owned by exactly one thread; message callbacks receive
/// it mutably, which is what makes every enqueued callback an owner-only
/// operation without runtime checks.
pub struct WorkerCx {
    hub: MessageHub,
    stop_requested: bool,
}

impl WorkerCx {
    /// Creates the context for `worker`.
    pub fn new(worker: WorkerId, config: SchedulerConfig, registry: HubRegistry) -> Self {
        Self {
            hub: MessageHub::new(worker, config, registry),
            stop_requested: false,
        }
    }

    /// This worker's id.
    pub fn worker_id(&self) -> WorkerId {
        self.hub.worker_id()
    }

    /// Owner-only access to this worker's hub.
    pub fn hub(&mut self) -> &mut MessageHub {
        &mut self.hub
    }

    /// Shared handle for cross-worker sends.
    pub fn registry(&self) -> HubRegistry {
        self.hub.registry().clone()
    }

    /// Asks the event loop to exit once the current batch is drained.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// True once a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Handles one wake-up: drains and delivers at least the initial batch
    /// of pending messages.
    ///
    /// The scheduler walks priorities from highest to lowest each pass,
    /// delivering up to `max(1, G >> (P_MAX - p))` messages per lane, so a
    /// high-priority arrival waits for at most `G` deliveries while every
    /// lane still makes progress. Messages enqueued before entry are
    /// always delivered before this returns; messages arriving during the
    /// handler may be deferred to the next wake-up, which the wake flag
    /// guarantees will come.
    pub fn on_event(&mut self) {
        // Consume first so a signal arriving mid-drain arms a fresh wake.
        self.hub.registry().notifier(self.worker_id()).consume();

        let min_priority = self.hub.config().min_priority;
        let max_priority = self.hub.config().max_priority;
        let granularity = self.hub.config().granularity;
        let num_lanes = self.hub.lane_count();

        // Messages that were pending before the first pass; all of them
        // must be delivered during this invocation.
        let mut num_initial = vec![0usize; num_lanes];
        let mut initial_pass = true;

        loop {
            if !initial_pass {
                // Other workers keep pushing into the incoming queue on
                // their own, but self-addressed messages sit in our local
                // list until someone moves them: push_messages is not
                // called while on_event runs.
                self.hub.deliver_local_messages();
            }

            // Reset the wake flag on the first pass only, so messages
            // arriving during later passes wake us again.
            self.hub.sort_incoming_messages_by_priority(initial_pass);

            if initial_pass {
                for lane in 0..num_lanes {
                    num_initial[lane] = self.hub.lane_len(lane);
                }
                initial_pass = false;
            }
            self.hub.record_pass();

            // How many top-priority messages to process before looking at
            // the incoming queue again.
            let effective_granularity = self.hub.total_pending().min(granularity);

            for priority in (min_priority..=max_priority).rev() {
                let lane = (priority as isize - min_priority as isize) as usize;

                // Priority has an exponential effect on throughput: each
                // step down halves the per-pass budget, but every lane
                // gets at least one delivery per pass.
                let exponent = (max_priority as isize - priority as isize) as u32;
                let mut to_process = effective_granularity
                    .checked_shr(exponent)
                    .unwrap_or(0)
                    .max(1);

                while to_process > 0 {
                    let Some(mut env) = self.hub.pop_lane(lane) else {
                        break;
                    };
                    to_process -= 1;
                    if num_initial[lane] > 0 {
                        num_initial[lane] -= 1;
                    }

                    if env.take_reloop() {
                        self.hub.requeue_local(env);
                        continue;
                    }

                    self.hub.record_delivery();
                    env.deliver(self);
                }
            }

            if num_initial.iter().all(|&n| n == 0) {
                break;
            }
        }
    }

    /// The worker event loop: wait, handle, flush, until stopped.
    pub(crate) fn run(mut self) {
        let worker = self.worker_id();
        CURRENT_WORKER.with(|c| c.set(Some(worker)));

        loop {
            self.hub.registry().notifier(worker).wait();
            self.on_event();
            self.hub.push_messages();
            if self.stop_requested {
                break;
            }
        }

        self.hub.assert_drained();
        CURRENT_WORKER.with(|c| c.set(None));
    }
}
