//! The flow executor.
//!
//! [`FlowEngine::run`] validates a flow against the seeded store, then
//! interprets the AST:
//!
//! - Sequences run children one after another.
//! - Parallel groups run children concurrently and join before completing.
//!   Leaf tasks take a permit from a bounded worker pool, so at most
//!   `workers` tasks execute at once across the whole run.
//! - Decisions run their predecessor, evaluate the predicate exactly once,
//!   and run one branch.
//!
//! Every successful task is journaled. When any task fails, the journal is
//! reverted newest first, each entry exactly once, and the original failure
//! is returned wrapped in [`Error::TaskFailed`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use fleetlb_core::observability::flow_span;

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::metrics::FlowMetrics;
use crate::services::Services;
use crate::store::FlowStore;
use crate::task::{RevertOutcome, TaskContext, TaskNode};

struct Run {
    store: FlowStore,
    completed: Mutex<Vec<TaskNode>>,
}

impl Run {
    fn push(&self, node: &TaskNode) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.clone());
    }

    fn take(&self) -> Vec<TaskNode> {
        std::mem::take(&mut *self.completed.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Runs flows against a set of services.
#[derive(Debug, Clone)]
pub struct FlowEngine {
    services: Services,
    workers: Arc<Semaphore>,
    metrics: FlowMetrics,
}

impl FlowEngine {
    /// Creates an engine whose worker pool size comes from the controller
    /// configuration.
    #[must_use]
    pub fn new(services: Services) -> Self {
        let workers = services.config.workers.max(1);
        Self {
            services,
            workers: Arc::new(Semaphore::new(workers)),
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the services tasks run against.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Runs a flow to completion and returns the final store.
    ///
    /// # Errors
    ///
    /// Returns a validation error before anything runs, or
    /// [`Error::TaskFailed`] after reverting every task that had succeeded.
    pub async fn run(&self, flow: &Flow, store: FlowStore) -> Result<FlowStore> {
        let seeded = store.names()?;
        flow.validate(seeded.iter().map(String::as_str))?;

        let run_id = Uuid::new_v4().to_string();
        let span = flow_span(flow.name(), &run_id);
        let started = Instant::now();
        let run = Run {
            store,
            completed: Mutex::new(Vec::new()),
        };

        let result = self.execute(flow, &run).instrument(span.clone()).await;
        match result {
            Ok(()) => {
                self.metrics
                    .observe_flow(flow.name(), true, started.elapsed());
                span.in_scope(|| tracing::info!(flow = flow.name(), "flow completed"));
                Ok(run.store)
            }
            Err(error) => {
                span.in_scope(|| {
                    tracing::warn!(flow = flow.name(), error = %error, "flow failed, reverting");
                });
                self.revert_completed(&run).instrument(span).await;
                self.metrics
                    .observe_flow(flow.name(), false, started.elapsed());
                Err(error)
            }
        }
    }

    fn execute<'a>(&'a self, flow: &'a Flow, run: &'a Run) -> BoxFuture<'a, Result<()>> {
        async move {
            match flow {
                Flow::Task(node) => self.execute_task(node, run).await,
                Flow::Sequence { children, .. } => {
                    for child in children {
                        self.execute(child, run).await?;
                    }
                    Ok(())
                }
                Flow::Parallel { children, .. } => {
                    let results =
                        join_all(children.iter().map(|child| self.execute(child, run))).await;
                    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
                }
                Flow::Decision(decision) => {
                    self.execute(&decision.predecessor, run).await?;
                    let taken = decision.evaluate(&run.store)?;
                    self.metrics.record_decision(decision.name(), taken);
                    tracing::info!(decision = decision.name(), branch = taken, "decision evaluated");
                    let branch = if taken {
                        &decision.on_true
                    } else {
                        &decision.on_false
                    };
                    self.execute(branch, run).await
                }
            }
        }
        .boxed()
    }

    async fn execute_task(&self, node: &TaskNode, run: &Run) -> Result<()> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| Error::internal("worker pool closed"))?;
        let ctx = TaskContext::new(node, &run.store, &self.services);
        tracing::debug!(task = node.name(), "executing task");
        match node.task().execute(&ctx).await {
            Ok(()) => {
                self.metrics.record_execution(node.name(), true);
                tracing::info!(task = node.name(), "task succeeded");
                run.push(node);
                Ok(())
            }
            Err(source) => {
                self.metrics.record_execution(node.name(), false);
                tracing::warn!(task = node.name(), error = %source, "task failed");
                Err(Error::TaskFailed {
                    task: node.name().to_string(),
                    source: Box::new(source),
                })
            }
        }
    }

    async fn revert_completed(&self, run: &Run) {
        for node in run.take().iter().rev() {
            let ctx = TaskContext::new(node, &run.store, &self.services);
            let outcome = node.task().revert(&ctx).await;
            match outcome {
                RevertOutcome::Reverted => tracing::info!(task = node.name(), "task reverted"),
                RevertOutcome::Skipped => tracing::debug!(task = node.name(), "nothing to revert"),
                RevertOutcome::LoggedFailure => {
                    tracing::error!(task = node.name(), "task revert failed");
                }
            }
            self.metrics.record_revert(node.name(), outcome);
        }
    }
}
