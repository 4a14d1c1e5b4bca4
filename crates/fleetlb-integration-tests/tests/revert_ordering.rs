//! Revert ordering of failed flows.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetlb_flow::{Error, Flow, FlowEngine, FlowStore, RevertOutcome, Services, Task, TaskContext};
use proptest::prelude::*;

#[derive(Default, Clone)]
struct Journal {
    executed: Arc<Mutex<Vec<String>>>,
    reverted: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn reverted(&self) -> Vec<String> {
        self.reverted.lock().unwrap().clone()
    }
}

struct Recording {
    name: String,
    fail: bool,
    journal: Journal,
}

impl Recording {
    fn flow(name: impl Into<String>, fail: bool, journal: &Journal) -> Flow {
        Flow::task(Self {
            name: name.into(),
            fail,
            journal: journal.clone(),
        })
    }
}

#[async_trait]
impl Task for Recording {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &TaskContext<'_>) -> fleetlb_flow::Result<()> {
        self.journal.executed.lock().unwrap().push(self.name.clone());
        if self.fail {
            return Err(Error::internal(format!("{} failed", self.name)));
        }
        Ok(())
    }

    async fn revert(&self, _ctx: &TaskContext<'_>) -> RevertOutcome {
        self.journal.reverted.lock().unwrap().push(self.name.clone());
        RevertOutcome::Reverted
    }
}

fn run(flow: &Flow) -> fleetlb_flow::Result<FlowStore> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(FlowEngine::new(Services::noop()).run(flow, FlowStore::new()))
}

proptest! {
    #[test]
    fn sequence_reverts_completed_tasks_newest_first(
        (len, failing) in (1usize..12).prop_flat_map(|len| (Just(len), 0..len)),
    ) {
        let journal = Journal::default();
        let children = (0..len)
            .map(|i| Recording::flow(format!("step-{i}"), i == failing, &journal))
            .collect();
        let flow = Flow::sequence("recorded", children);

        let err = run(&flow).unwrap_err();

        let failing_name = format!("step-{failing}");
        prop_assert_eq!(err.failed_task(), Some(failing_name.as_str()));
        prop_assert_eq!(journal.executed().len(), failing + 1);
        let expected: Vec<String> = (0..failing).rev().map(|i| format!("step-{i}")).collect();
        prop_assert_eq!(journal.reverted(), expected);
    }

    #[test]
    fn successful_sequence_reverts_nothing(len in 1usize..12) {
        let journal = Journal::default();
        let children = (0..len)
            .map(|i| Recording::flow(format!("step-{i}"), false, &journal))
            .collect();

        run(&Flow::sequence("recorded", children)).unwrap();

        prop_assert_eq!(journal.executed().len(), len);
        prop_assert!(journal.reverted().is_empty());
    }
}

#[test]
fn parallel_group_is_reverted_after_the_later_step() {
    let journal = Journal::default();
    let flow = Flow::sequence(
        "recorded",
        vec![
            Recording::flow("first", false, &journal),
            Flow::parallel(
                "group",
                vec![
                    Recording::flow("left", false, &journal),
                    Recording::flow("right", false, &journal),
                ],
            ),
            Recording::flow("last", true, &journal),
        ],
    );

    let err = run(&flow).unwrap_err();
    assert_eq!(err.failed_task(), Some("last"));

    let reverted = journal.reverted();
    assert_eq!(reverted.len(), 3);
    let group: BTreeSet<&str> = reverted[..2].iter().map(String::as_str).collect();
    assert_eq!(group, BTreeSet::from(["left", "right"]));
    assert_eq!(reverted[2], "first");
}

#[test]
fn failure_inside_parallel_reverts_siblings_that_finished() {
    let journal = Journal::default();
    let flow = Flow::sequence(
        "recorded",
        vec![
            Recording::flow("first", false, &journal),
            Flow::parallel(
                "group",
                vec![
                    Recording::flow("ok", false, &journal),
                    Recording::flow("broken", true, &journal),
                ],
            ),
            Recording::flow("never", false, &journal),
        ],
    );

    run(&flow).unwrap_err();

    assert!(!journal.executed().contains(&"never".to_string()));
    assert_eq!(journal.reverted(), vec!["ok".to_string(), "first".to_string()]);
}
