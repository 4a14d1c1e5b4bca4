//! The unit of work and its compensating action.
//!
//! A [`Task`] declares the store names it `requires` and `provides`,
//! performs one round trip against one backend in `execute`, and undoes it in
//! `revert`. The engine reverts a task only when a *later* task of the same
//! run fails; a task whose own `execute` failed is never reverted for that
//! failure.
//!
//! `revert` cannot fail. It reports a [`RevertOutcome`] instead, so cleanup
//! that breaks while a flow is already failing is logged and never masks the
//! original error.
//!
//! A [`TaskNode`] places a task in a flow, optionally renaming its store
//! names (`rebind`) or fixing some inputs to constant values (`inject`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use fleetlb_core::Repositories;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::services::Services;
use crate::store::{downcast, FlowStore, Key, Value};

/// What a revert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevertOutcome {
    /// The effect of `execute` was undone or driven to ERROR.
    Reverted,
    /// There was nothing to undo.
    Skipped,
    /// Undoing failed; the failure was logged and swallowed.
    LoggedFailure,
}

impl RevertOutcome {
    /// Returns the metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reverted => "reverted",
            Self::Skipped => "skipped",
            Self::LoggedFailure => "logged_failure",
        }
    }

    /// Converts a cleanup result, logging the failure.
    pub fn from_result<E: fmt::Display>(task: &str, result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Reverted,
            Err(error) => {
                tracing::error!(task, error = %error, "revert failed, continuing cleanup");
                Self::LoggedFailure
            }
        }
    }
}

/// An atomic unit of work with a compensating revert.
#[async_trait]
pub trait Task: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Store names read by `execute`.
    fn requires(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Store names written by `execute`.
    fn provides(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Performs the work.
    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()>;

    /// Undoes a successful `execute`.
    async fn revert(&self, _ctx: &TaskContext<'_>) -> RevertOutcome {
        RevertOutcome::Skipped
    }
}

/// A task placed in a flow.
#[derive(Clone)]
pub struct TaskNode {
    task: Arc<dyn Task>,
    name: String,
    rebind: BTreeMap<&'static str, String>,
    inject: BTreeMap<&'static str, Value>,
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("rebind", &self.rebind)
            .field("inject", &self.inject.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskNode {
    /// Wraps a task.
    pub fn new(task: impl Task + 'static) -> Self {
        let name = task.name().to_string();
        Self {
            task: Arc::new(task),
            name,
            rebind: BTreeMap::new(),
            inject: BTreeMap::new(),
        }
    }

    /// Overrides the node name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reads and writes the task's `from` name as `to` in the store.
    #[must_use]
    pub fn rebind(mut self, from: &'static str, to: impl Into<String>) -> Self {
        self.rebind.insert(from, to.into());
        self
    }

    /// Fixes an input to a constant; the store is not consulted for it.
    #[must_use]
    pub fn inject<T: Send + Sync + 'static>(mut self, key: Key<T>, value: T) -> Self {
        self.inject.insert(key.name(), Arc::new(value));
        self
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the wrapped task.
    #[must_use]
    pub fn task(&self) -> &dyn Task {
        &*self.task
    }

    /// Returns the store name a task name is bound to.
    #[must_use]
    pub fn bound<'a>(&'a self, name: &'a str) -> &'a str {
        self.rebind.get(name).map_or(name, String::as_str)
    }

    /// Store names this node reads.
    #[must_use]
    pub fn requires(&self) -> BTreeSet<String> {
        self.task
            .requires()
            .into_iter()
            .filter(|name| !self.inject.contains_key(name))
            .map(|name| self.bound(name).to_string())
            .collect()
    }

    /// Store names this node writes.
    #[must_use]
    pub fn provides(&self) -> BTreeSet<String> {
        self.task
            .provides()
            .into_iter()
            .map(|name| self.bound(name).to_string())
            .collect()
    }

    pub(crate) fn isolate(&mut self, rename: &dyn Fn(&str) -> String, suffix: &str) {
        let names: BTreeSet<&'static str> = self
            .task
            .requires()
            .into_iter()
            .chain(self.task.provides())
            .filter(|name| !self.inject.contains_key(name))
            .collect();
        for name in names {
            let renamed = rename(self.bound(name));
            self.rebind.insert(name, renamed);
        }
        self.name = format!("{}-{suffix}", self.name);
    }
}

/// What a task sees while it runs.
pub struct TaskContext<'a> {
    node: &'a TaskNode,
    store: &'a FlowStore,
    services: &'a Services,
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.node.name)
            .finish_non_exhaustive()
    }
}

impl<'a> TaskContext<'a> {
    /// Creates a context for one node.
    #[must_use]
    pub const fn new(node: &'a TaskNode, store: &'a FlowStore, services: &'a Services) -> Self {
        Self {
            node,
            store,
            services,
        }
    }

    /// Returns the node name.
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.node.name
    }

    /// Returns the shared services.
    #[must_use]
    pub const fn services(&self) -> &Services {
        self.services
    }

    /// Returns the repositories.
    #[must_use]
    pub fn repos(&self) -> &Repositories {
        &self.services.repos
    }

    /// Returns the controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.services.config
    }

    /// Reads an input.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is missing or has another type.
    pub fn get<T: Clone + 'static>(&self, key: Key<T>) -> Result<T> {
        if let Some(value) = self.node.inject.get(key.name()) {
            return downcast(key.name(), value);
        }
        self.store.get_named(self.node.bound(key.name()))
    }

    /// Reads an optional input that the task does not declare.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has another type.
    pub fn get_opt<T: Clone + 'static>(&self, key: Key<T>) -> Result<Option<T>> {
        if let Some(value) = self.node.inject.get(key.name()) {
            return downcast(key.name(), value).map(Some);
        }
        self.store.get_opt_named(self.node.bound(key.name()))
    }

    /// Writes an output.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn put<T: Send + Sync + 'static>(&self, key: Key<T>, value: T) -> Result<()> {
        self.store
            .insert_named(self.node.bound(key.name()), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: Key<u32> = Key::new("input");
    const OUTPUT: Key<u32> = Key::new("output");

    struct Double;

    #[async_trait]
    impl Task for Double {
        fn name(&self) -> &str {
            "double"
        }

        fn requires(&self) -> Vec<&'static str> {
            vec![INPUT.name()]
        }

        fn provides(&self) -> Vec<&'static str> {
            vec![OUTPUT.name()]
        }

        async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
            let input = ctx.get(INPUT)?;
            ctx.put(OUTPUT, input * 2)
        }
    }

    #[test]
    fn rebind_renames_declared_names() {
        let node = TaskNode::new(Double).rebind("input", "seed");
        assert_eq!(node.requires(), BTreeSet::from(["seed".to_string()]));
        assert_eq!(node.provides(), BTreeSet::from(["output".to_string()]));
    }

    #[test]
    fn injected_inputs_are_not_required() {
        let node = TaskNode::new(Double).inject(INPUT, 4);
        assert!(node.requires().is_empty());
    }

    #[test]
    fn isolate_suffixes_non_shared_names() {
        let mut node = TaskNode::new(Double);
        let rename = |name: &str| {
            if name == "input" {
                name.to_string()
            } else {
                format!("{name}_1")
            }
        };
        node.isolate(&rename, "1");
        assert_eq!(node.requires(), BTreeSet::from(["input".to_string()]));
        assert_eq!(node.provides(), BTreeSet::from(["output_1".to_string()]));
        assert_eq!(node.name(), "double-1");
    }

    #[tokio::test]
    async fn context_reads_injected_then_store() {
        let services = Services::noop();
        let store = FlowStore::new().with(INPUT, 5);
        let node = TaskNode::new(Double).inject(INPUT, 10);
        let ctx = TaskContext::new(&node, &store, &services);
        node.task().execute(&ctx).await.unwrap();
        assert_eq!(store.get(OUTPUT).unwrap(), 20);

        let plain = TaskNode::new(Double);
        let ctx = TaskContext::new(&plain, &store, &services);
        plain.task().execute(&ctx).await.unwrap();
        assert_eq!(store.get(OUTPUT).unwrap(), 10);
    }

    #[test]
    fn revert_outcome_from_result() {
        assert_eq!(
            RevertOutcome::from_result::<String>("t", Ok(())),
            RevertOutcome::Reverted
        );
        assert_eq!(
            RevertOutcome::from_result("t", Err("boom")),
            RevertOutcome::LoggedFailure
        );
    }
}
