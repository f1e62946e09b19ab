use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{AckPolicy, ConverterConfig};
use crate::handler::{Disposition, TaskHandler, TaskOutcome};
use crate::transport::{Delivery, TaskSource};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub completed: usize,
    pub already_processed: usize,
    pub claimed_elsewhere: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub requeued: usize,
    pub transport_errors: usize,
    pub panicked: usize,
}

impl PoolReport {
    pub fn handled(&self) -> usize {
        self.completed + self.already_processed + self.claimed_elsewhere + self.cancelled + self.failed
    }

    fn record(&mut self, joined: Result<DeliveryResult, JoinError>) {
        let result = match joined {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "task handler panicked");
                self.panicked += 1;
                return;
            }
        };
        match result.outcome {
            TaskOutcome::Completed { .. } => self.completed += 1,
            TaskOutcome::AlreadyProcessed { .. } => self.already_processed += 1,
            TaskOutcome::ClaimedElsewhere { .. } => self.claimed_elsewhere += 1,
            TaskOutcome::Cancelled { .. } => self.cancelled += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
        }
        if result.disposition == Disposition::Requeue {
            self.requeued += 1;
        }
        if !result.settled {
            self.transport_errors += 1;
        }
    }
}

struct DeliveryResult {
    outcome: TaskOutcome,
    disposition: Disposition,
    settled: bool,
}

/// Pulls deliveries from a [`TaskSource`] and runs at most `concurrency`
/// handlers at a time.
pub struct WorkerPool {
    handler: Arc<TaskHandler>,
    source: Arc<dyn TaskSource>,
    concurrency: usize,
    poll_interval: Duration,
    ack_policy: AckPolicy,
}

impl WorkerPool {
    pub fn new(handler: Arc<TaskHandler>, source: Arc<dyn TaskSource>) -> Self {
        Self {
            handler,
            source,
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            ack_policy: AckPolicy::AckAlways,
        }
    }

    pub fn from_config(
        config: &ConverterConfig,
        handler: Arc<TaskHandler>,
        source: Arc<dyn TaskSource>,
    ) -> Self {
        Self::new(handler, source)
            .with_concurrency(config.worker.concurrency)
            .with_poll_interval(config.worker.poll_interval())
            .with_ack_policy(config.worker.ack_policy)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Processes deliveries until `shutdown` fires. Cancelling `shutdown`
    /// also cancels transcodes still in flight. A delivery being handed back
    /// is held for one poll interval first so a task that keeps failing is
    /// not retried in a tight loop.
    pub async fn run(&self, shutdown: CancellationToken) -> PoolReport {
        self.drive(shutdown, false).await
    }

    /// Processes what the source holds and returns once it is drained. A
    /// delivery seen twice in one run is handed back and ends the run.
    pub async fn run_until_idle(&self, shutdown: CancellationToken) -> PoolReport {
        self.drive(shutdown, true).await
    }

    async fn drive(&self, shutdown: CancellationToken, stop_when_idle: bool) -> PoolReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<DeliveryResult> = JoinSet::new();
        let mut report = PoolReport::default();
        let mut seen = HashSet::new();
        let requeue_delay = (!stop_when_idle).then_some(self.poll_interval);
        info!(concurrency = self.concurrency, worker = self.handler.worker_id(), "worker pool started");

        loop {
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break None,
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => report.record(joined),
                    permit = semaphore.clone().acquire_owned() => break permit.ok(),
                }
            };
            let Some(permit) = permit else { break };

            let delivery = match self.source.next_delivery().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    if stop_when_idle {
                        match in_flight.join_next().await {
                            Some(joined) => {
                                report.record(joined);
                                continue;
                            }
                            None => break,
                        }
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(error = %err, "failed to fetch next task");
                    report.transport_errors += 1;
                    if stop_when_idle {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => continue,
                    }
                }
            };

            if stop_when_idle && !seen.insert(delivery.id().to_string()) {
                debug!(id = delivery.id(), "delivery came back within this run; stopping");
                settle(delivery, Disposition::Requeue).await;
                break;
            }

            let handler = Arc::clone(&self.handler);
            let cancel = shutdown.child_token();
            let policy = self.ack_policy;
            in_flight.spawn(async move {
                let _permit = permit;
                process(handler, delivery, policy, cancel, requeue_delay).await
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            report.record(joined);
        }
        info!(
            handled = report.handled(),
            failed = report.failed,
            requeued = report.requeued,
            "worker pool stopped"
        );
        report
    }
}

async fn process(
    handler: Arc<TaskHandler>,
    delivery: Box<dyn Delivery>,
    policy: AckPolicy,
    cancel: CancellationToken,
    requeue_delay: Option<Duration>,
) -> DeliveryResult {
    let outcome = handler.handle_payload(delivery.payload(), &cancel).await;
    let disposition = outcome.disposition(policy);
    if let (Disposition::Requeue, Some(delay)) = (disposition, requeue_delay) {
        // Unsettled deliveries are not handed out again.
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
    let settled = settle(delivery, disposition).await;
    DeliveryResult {
        outcome,
        disposition,
        settled,
    }
}

async fn settle(delivery: Box<dyn Delivery>, disposition: Disposition) -> bool {
    let id = delivery.id().to_string();
    let result = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Requeue => delivery.requeue().await,
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            error!(id = %id, error = %err, ?disposition, "failed to settle delivery");
            false
        }
    }
}
