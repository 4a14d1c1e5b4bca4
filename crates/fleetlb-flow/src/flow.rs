//! The flow AST.
//!
//! A [`Flow`] is one of four shapes:
//!
//! | Shape | Execution |
//! |-------|-----------|
//! | `Task` | Runs one [`TaskNode`] |
//! | `Sequence` | Runs children in order |
//! | `Parallel` | Runs children concurrently, joins before completing |
//! | `Decision` | Runs a predecessor, evaluates a predicate once on one of its outputs, runs one branch |
//!
//! [`Flow::validate`] checks the data contract before anything runs: every
//! name a task requires must be seeded or provided by something that runs
//! before it, parallel siblings must not write the same name, and both
//! branches of a decision must provide the decision's declared outputs.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::{FlowStore, Key};
use crate::task::{Task, TaskNode};

type Predicate = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<bool> + Send + Sync>;

/// A composition of tasks.
#[derive(Clone)]
pub enum Flow {
    /// A single task.
    Task(TaskNode),
    /// Children run in order.
    Sequence {
        /// Flow name.
        name: String,
        /// Children.
        children: Vec<Flow>,
    },
    /// Children run concurrently.
    Parallel {
        /// Flow name.
        name: String,
        /// Children.
        children: Vec<Flow>,
    },
    /// A two-way branch.
    Decision(Box<Decision>),
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(node) => write!(f, "Task({})", node.name()),
            Self::Sequence { name, children } => f
                .debug_struct("Sequence")
                .field("name", name)
                .field("children", children)
                .finish(),
            Self::Parallel { name, children } => f
                .debug_struct("Parallel")
                .field("name", name)
                .field("children", children)
                .finish(),
            Self::Decision(decision) => decision.fmt(f),
        }
    }
}

impl From<TaskNode> for Flow {
    fn from(node: TaskNode) -> Self {
        Self::Task(node)
    }
}

impl From<Decision> for Flow {
    fn from(decision: Decision) -> Self {
        Self::Decision(Box::new(decision))
    }
}

impl Flow {
    /// Wraps a task in a node.
    pub fn task(task: impl Task + 'static) -> Self {
        Self::Task(TaskNode::new(task))
    }

    /// Creates a sequence.
    pub fn sequence(name: impl Into<String>, children: Vec<Flow>) -> Self {
        Self::Sequence {
            name: name.into(),
            children,
        }
    }

    /// Creates a parallel group.
    pub fn parallel(name: impl Into<String>, children: Vec<Flow>) -> Self {
        Self::Parallel {
            name: name.into(),
            children,
        }
    }

    /// Returns the flow name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Task(node) => node.name(),
            Self::Sequence { name, .. } | Self::Parallel { name, .. } => name,
            Self::Decision(decision) => &decision.name,
        }
    }

    /// Store names this flow needs from outside.
    #[must_use]
    pub fn requires(&self) -> BTreeSet<String> {
        match self {
            Self::Task(node) => node.requires(),
            Self::Sequence { children, .. } => {
                let mut required = BTreeSet::new();
                let mut provided = BTreeSet::new();
                for child in children {
                    required.extend(child.requires().difference(&provided).cloned());
                    provided.extend(child.provides());
                }
                required
            }
            Self::Parallel { children, .. } => {
                children.iter().flat_map(Self::requires).collect()
            }
            Self::Decision(decision) => {
                let mut required = decision.predecessor.requires();
                let after = decision.predecessor.provides();
                for branch in [&decision.on_true, &decision.on_false] {
                    required.extend(branch.requires().difference(&after).cloned());
                }
                required
            }
        }
    }

    /// Store names this flow writes.
    #[must_use]
    pub fn provides(&self) -> BTreeSet<String> {
        match self {
            Self::Task(node) => node.provides(),
            Self::Sequence { children, .. } | Self::Parallel { children, .. } => {
                children.iter().flat_map(Self::provides).collect()
            }
            Self::Decision(decision) => {
                let mut provided = decision.predecessor.provides();
                provided.extend(decision.outputs.iter().cloned());
                provided
            }
        }
    }

    /// Checks the data contract against the names seeded before the run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsatisfiedRequirements`],
    /// [`Error::ParallelConflict`], [`Error::UndeclaredDecisionKey`] or
    /// [`Error::MismatchedDecisionOutputs`].
    pub fn validate<'a>(&self, seeded: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let available = seeded.into_iter().map(str::to_string).collect();
        self.validate_in(&available).map(|_| ())
    }

    fn validate_in(&self, available: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        match self {
            Self::Task(node) => {
                let missing: Vec<String> =
                    node.requires().difference(available).cloned().collect();
                if !missing.is_empty() {
                    return Err(Error::UnsatisfiedRequirements {
                        flow: node.name().to_string(),
                        missing,
                    });
                }
                let mut after = available.clone();
                after.extend(node.provides());
                Ok(after)
            }
            Self::Sequence { children, .. } => {
                let mut after = available.clone();
                for child in children {
                    after = child.validate_in(&after)?;
                }
                Ok(after)
            }
            Self::Parallel { name, children } => {
                let mut after = available.clone();
                let mut written = BTreeSet::new();
                for child in children {
                    child.validate_in(available)?;
                    for provided in child.provides() {
                        if !written.insert(provided.clone()) {
                            return Err(Error::ParallelConflict {
                                flow: name.clone(),
                                name: provided,
                            });
                        }
                    }
                }
                after.extend(written);
                Ok(after)
            }
            Self::Decision(decision) => decision.validate_in(available),
        }
    }

    /// Renames every store name this flow uses, except `shared`, by
    /// appending `_{suffix}`.
    ///
    /// Copies of one sub-flow isolated with different suffixes can run side
    /// by side in a [`Flow::Parallel`] without writing over each other.
    #[must_use]
    pub fn isolate(mut self, suffix: &str, shared: &[&str]) -> Self {
        let rename = |name: &str| {
            if shared.contains(&name) {
                name.to_string()
            } else {
                format!("{name}_{suffix}")
            }
        };
        self.isolate_with(&rename, suffix);
        self
    }

    fn isolate_with(&mut self, rename: &dyn Fn(&str) -> String, suffix: &str) {
        match self {
            Self::Task(node) => node.isolate(rename, suffix),
            Self::Sequence { name, children } | Self::Parallel { name, children } => {
                *name = format!("{name}-{suffix}");
                for child in children {
                    child.isolate_with(rename, suffix);
                }
            }
            Self::Decision(decision) => {
                decision.name = format!("{}-{suffix}", decision.name);
                decision.key = rename(&decision.key);
                decision.outputs = decision.outputs.iter().map(|n| rename(n)).collect();
                decision.predecessor.isolate_with(rename, suffix);
                decision.on_true.isolate_with(rename, suffix);
                decision.on_false.isolate_with(rename, suffix);
            }
        }
    }

    /// Counts the task nodes in this flow.
    #[must_use]
    pub fn task_count(&self) -> usize {
        match self {
            Self::Task(_) => 1,
            Self::Sequence { children, .. } | Self::Parallel { children, .. } => {
                children.iter().map(Self::task_count).sum()
            }
            Self::Decision(decision) => {
                decision.predecessor.task_count()
                    + decision.on_true.task_count()
                    + decision.on_false.task_count()
            }
        }
    }
}

/// A branch evaluated once on a value its predecessor provides.
#[derive(Clone)]
pub struct Decision {
    name: String,
    pub(crate) predecessor: Flow,
    key: String,
    predicate: Predicate,
    pub(crate) on_true: Flow,
    pub(crate) on_false: Flow,
    outputs: BTreeSet<String>,
}

impl fmt::Debug for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decision")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("predecessor", &self.predecessor)
            .field("on_true", &self.on_true)
            .field("on_false", &self.on_false)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Decision {
    /// Creates a decision on the value `predecessor` writes under `key`.
    ///
    /// Both branches start empty and no outputs are declared.
    pub fn on<T, F>(name: impl Into<String>, predecessor: Flow, key: Key<T>, predicate: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            on_true: Flow::sequence(format!("{name}-true"), Vec::new()),
            on_false: Flow::sequence(format!("{name}-false"), Vec::new()),
            name,
            predecessor,
            key: key.name().to_string(),
            predicate: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                value.downcast_ref::<T>().map(|typed| predicate(typed))
            }),
            outputs: BTreeSet::new(),
        }
    }

    /// Sets the branch taken when the predicate holds.
    #[must_use]
    pub fn if_true(mut self, flow: Flow) -> Self {
        self.on_true = flow;
        self
    }

    /// Sets the branch taken when the predicate does not hold.
    #[must_use]
    pub fn if_false(mut self, flow: Flow) -> Self {
        self.on_false = flow;
        self
    }

    /// Declares the names both branches must provide.
    #[must_use]
    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|name| (*name).to_string()).collect();
        self
    }

    /// Returns the decision name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the predicate against the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is missing or has another type.
    pub fn evaluate(&self, store: &FlowStore) -> Result<bool> {
        let value = store.raw(&self.key)?.ok_or_else(|| Error::MissingValue {
            name: self.key.clone(),
        })?;
        (self.predicate)(&*value).ok_or_else(|| Error::TypeMismatch {
            name: self.key.clone(),
            expected: "decision input",
        })
    }

    fn validate_in(&self, available: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let after = self.predecessor.validate_in(available)?;
        if !self.predecessor.provides().contains(&self.key) {
            return Err(Error::UndeclaredDecisionKey {
                decision: self.name.clone(),
                key: self.key.clone(),
            });
        }
        for (branch, flow) in [("true", &self.on_true), ("false", &self.on_false)] {
            flow.validate_in(&after)?;
            let provided = flow.provides();
            let missing: Vec<String> = self.outputs.difference(&provided).cloned().collect();
            if !missing.is_empty() {
                return Err(Error::MismatchedDecisionOutputs {
                    decision: self.name.clone(),
                    branch,
                    missing,
                });
            }
        }
        let mut result = after;
        result.extend(self.outputs.iter().cloned());
        Ok(result)
    }
}
