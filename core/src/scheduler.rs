use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::compare::{compare, ComparisonMode};
use crate::process::{CancelSignal, CancelSource, ExitKind, ProcessOutcome, ProcessSlot};
use crate::state::StateCell;
use crate::status::TestcaseStatus;
use crate::testcase::{Testcase, TestcaseId};

/// Drives one testcase end-to-end: process execution, then judging.
pub struct TestcaseTask {
    testcase: Testcase,
    slot: ProcessSlot,
    comparison: ComparisonMode,
    state: Arc<StateCell>,
}

impl TestcaseTask {
    pub(crate) fn new(
        testcase: Testcase,
        slot: ProcessSlot,
        comparison: ComparisonMode,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            testcase,
            slot,
            comparison,
            state,
        }
    }

    pub fn id(&self) -> &TestcaseId {
        &self.testcase.id
    }

    fn mark_running(&self) {
        self.state
            .transition(&self.testcase.id, TestcaseStatus::Running);
    }

    fn cancel_without_run(&self) {
        self.state
            .transition(&self.testcase.id, TestcaseStatus::Cancelled);
    }

    async fn run(self, cancel: CancelSignal) {
        let outcome = self.slot.execute(&self.testcase.input, cancel).await;
        let status = self.judge(&outcome);
        self.state.finish(&self.testcase.id, status, outcome);
    }

    fn judge(&self, outcome: &ProcessOutcome) -> TestcaseStatus {
        match &outcome.exit {
            ExitKind::TimedOut => TestcaseStatus::TimedOut,
            ExitKind::Cancelled => TestcaseStatus::Cancelled,
            ExitKind::SpawnError(_) | ExitKind::Signaled(_) => TestcaseStatus::RuntimeError,
            ExitKind::Exited(code) if *code != 0 => TestcaseStatus::RuntimeError,
            ExitKind::Exited(_) => match &self.testcase.expected {
                None => TestcaseStatus::Passed,
                Some(expected) => {
                    if compare(expected, &outcome.stdout, self.comparison) {
                        TestcaseStatus::Passed
                    } else {
                        TestcaseStatus::WrongAnswer
                    }
                }
            },
        }
    }
}

/// Bounded pool of concurrently-running testcase tasks. Admission is FIFO
/// in input order; at most `max_parallel` processes run at any instant.
pub struct Scheduler {
    cancel: CancelSource,
    driver: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    pub fn schedule(tasks: Vec<TestcaseTask>, max_parallel: usize, cancel: CancelSource) -> Self {
        assert!(max_parallel >= 1, "max_parallel must be at least 1");
        let cancel_rx = cancel.subscribe();
        let driver = tokio::spawn(drive(tasks, max_parallel, cancel_rx));
        Self { cancel, driver }
    }

    /// Resolves once every task has reached a terminal status and every
    /// spawned process has exited.
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.driver).await {
            log::warn!("Scheduler driver failed: {}", e);
        }
    }

    /// Stops admitting queued tasks, cancels the running ones, and returns
    /// only after full teardown.
    pub async fn cancel_all(&mut self) {
        self.cancel.send_replace(true);
        self.wait().await;
    }
}

async fn drive(tasks: Vec<TestcaseTask>, max_parallel: usize, cancel: CancelSignal) {
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut running = JoinSet::new();

    for task in tasks {
        let mut admission_cancel = cancel.clone();
        let permit = tokio::select! {
            biased;
            _ = wait_cancelled(&mut admission_cancel) => {
                task.cancel_without_run();
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    task.cancel_without_run();
                    continue;
                }
            },
        };
        if *cancel.borrow() {
            // cancellation raced the permit
            task.cancel_without_run();
            continue;
        }
        task.mark_running();
        let run_cancel = cancel.clone();
        running.spawn(async move {
            let _permit = permit;
            task.run(run_cancel).await;
        });
    }

    while running.join_next().await.is_some() {}
}

async fn wait_cancelled(cancel: &mut CancelSignal) {
    if cancel.wait_for(|&cancelled| cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::process::cancel_channel;
    use crate::status::StatusChange;

    fn make_tasks(
        cases: &[(u32, &str)],
        state: &Arc<StateCell>,
    ) -> Vec<TestcaseTask> {
        state.reset(1, cases.iter().map(|&(id, _)| TestcaseId::Num(id)));
        cases
            .iter()
            .map(|&(id, cmd)| {
                TestcaseTask::new(
                    Testcase::run_only(id, ""),
                    ProcessSlot::new("/bin/sh", cmd),
                    ComparisonMode::Exact,
                    state.clone(),
                )
            })
            .collect()
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusChange>) -> Vec<StatusChange> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn max_concurrent_running(events: &[StatusChange]) -> usize {
        let mut running = 0usize;
        let mut peak = 0usize;
        for ev in events {
            match (ev.old, ev.new.is_terminal()) {
                (TestcaseStatus::Waiting, false) => {
                    running += 1;
                    peak = peak.max(running);
                }
                (TestcaseStatus::Running, true) => running -= 1,
                _ => {}
            }
        }
        peak
    }

    #[tokio::test]
    async fn respects_the_parallelism_bound() {
        let state = Arc::new(StateCell::default());
        let tasks = make_tasks(
            &[(1, "sleep 0.3"), (2, "sleep 0.3"), (3, "sleep 0.3"), (4, "sleep 0.3")],
            &state,
        );
        let mut rx = state.subscribe();
        let (cancel, _) = cancel_channel();

        let started = Instant::now();
        Scheduler::schedule(tasks, 2, cancel).wait().await;
        // 4 sleeps of 0.3s on 2 slots need at least two batches
        assert!(started.elapsed() >= Duration::from_millis(550));

        let events = drain(&mut rx);
        assert!(max_concurrent_running(&events) <= 2);
        let snap = state.snapshot();
        assert!(snap.all_terminal());
        assert_eq!(snap.count(TestcaseStatus::Passed), 4);
    }

    #[tokio::test]
    async fn admission_is_fifo() {
        let state = Arc::new(StateCell::default());
        let tasks = make_tasks(&[(1, "true"), (2, "true"), (3, "true")], &state);
        let mut rx = state.subscribe();
        let (cancel, _) = cancel_channel();

        Scheduler::schedule(tasks, 1, cancel).wait().await;

        let running_order: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|ev| ev.new == TestcaseStatus::Running)
            .map(|ev| ev.id)
            .collect();
        assert_eq!(
            running_order,
            vec![TestcaseId::Num(1), TestcaseId::Num(2), TestcaseId::Num(3)]
        );
    }

    #[tokio::test]
    async fn cancel_all_stops_queued_and_running_tasks() {
        let state = Arc::new(StateCell::default());
        let tasks = make_tasks(&[(1, "sleep 5"), (2, "sleep 5"), (3, "sleep 5")], &state);
        let (cancel, _) = cancel_channel();

        let mut scheduler = Scheduler::schedule(tasks, 1, cancel);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        scheduler.cancel_all().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let snap = state.snapshot();
        assert!(snap.all_terminal());
        assert_eq!(snap.count(TestcaseStatus::Cancelled), 3);
    }

    #[tokio::test]
    async fn every_testcase_reaches_exactly_one_terminal_state() {
        let state = Arc::new(StateCell::default());
        let tasks = make_tasks(
            &[(1, "true"), (2, "exit 3"), (3, "false"), (4, "true")],
            &state,
        );
        let mut rx = state.subscribe();
        let (cancel, _) = cancel_channel();

        Scheduler::schedule(tasks, 4, cancel).wait().await;

        let mut terminal_count: HashMap<TestcaseId, usize> = HashMap::new();
        for ev in drain(&mut rx) {
            if ev.new.is_terminal() {
                *terminal_count.entry(ev.id).or_default() += 1;
            }
        }
        assert_eq!(terminal_count.len(), 4);
        assert!(terminal_count.values().all(|&n| n == 1));

        let snap = state.snapshot();
        assert_eq!(snap.count(TestcaseStatus::Passed), 2);
        assert_eq!(snap.count(TestcaseStatus::RuntimeError), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "max_parallel must be at least 1")]
    async fn zero_parallelism_is_a_caller_bug() {
        let (cancel, _) = cancel_channel();
        Scheduler::schedule(Vec::new(), 0, cancel);
    }
}
