//! The worker pool: one OS thread per worker.

use crate::hub::HubRegistry;
use crate::message::{Envelope, ThreadMessage};
use crate::worker::WorkerCx;
use nimbus_common::{NimbusError, Result, RuntimeConfig, WorkerId};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Runs `workers` event loops on dedicated OS threads.
///
/// On start a single bootstrap message is delivered to worker 0; there is
/// no other external command surface. Shutdown delivers a stop message to
/// every worker and joins the threads; callers must have quiesced their
/// own message traffic first, since a worker that has processed its stop
/// message no longer drains its queues.
pub struct WorkerPool {
    config: RuntimeConfig,
    registry: HubRegistry,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Validates the config, spawns the workers, and delivers the
    /// bootstrap message to worker 0.
    pub fn start(config: RuntimeConfig, bootstrap: impl ThreadMessage) -> Result<Self> {
        config.validate()?;

        let registry = HubRegistry::new(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for i in 0..config.workers {
            let cx = WorkerCx::new(WorkerId(i), config.scheduler.clone(), registry.clone());
            let handle = std::thread::Builder::new()
                .name(format!("nimbus-worker-{i}"))
                .spawn(move || cx.run())
                .map_err(NimbusError::Io)?;
            handles.push(handle);
        }
        info!(workers = config.workers, "worker pool started");

        registry.insert_external_message(
            WorkerId(0),
            Envelope::new(config.scheduler.ordered_priority, bootstrap),
        );

        Ok(Self {
            config,
            registry,
            handles,
        })
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Shared handle for sending messages into the pool.
    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// Stops every worker and joins its thread.
    pub fn shutdown(mut self) {
        debug!("stopping {} workers", self.config.workers);
        for i in 0..self.config.workers {
            self.registry.insert_external_message(
                WorkerId(i),
                Envelope::new(self.config.scheduler.min_priority, |cx: &mut WorkerCx| {
                    cx.request_stop();
                }),
            );
        }
        for handle in self.handles.drain(..) {
            handle.join().expect("worker thread panicked");
        }
        info!("worker pool stopped");
    }
}
