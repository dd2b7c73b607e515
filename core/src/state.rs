use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;

use crate::process::ProcessOutcome;
use crate::status::{CompileStatus, StatusChange, TestcaseStatus};
use crate::testcase::TestcaseId;

/// Point-in-time view of one run, safe to clone and render without
/// affecting the run itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunState {
    pub generation: u64,
    pub compile_status: CompileStatus,
    pub statuses: BTreeMap<TestcaseId, TestcaseStatus>,
}

impl RunState {
    pub fn all_terminal(&self) -> bool {
        self.statuses.values().all(|st| st.is_terminal())
    }

    pub fn count(&self, status: TestcaseStatus) -> usize {
        self.statuses.values().filter(|&&st| st == status).count()
    }
}

#[derive(Default)]
struct StateInner {
    state: RunState,
    outcomes: BTreeMap<TestcaseId, ProcessOutcome>,
    compile_outcome: Option<ProcessOutcome>,
    subscribers: Vec<mpsc::UnboundedSender<StatusChange>>,
}

/// The single synchronization point for run-state mutation. Every status
/// transition is applied and published under one lock, so subscribers see
/// per-testcase events in transition order and snapshot readers never
/// observe a half-updated map.
#[derive(Default)]
pub(crate) struct StateCell {
    inner: Mutex<StateInner>,
}

impl StateCell {
    pub fn snapshot(&self) -> RunState {
        self.lock().state.clone()
    }

    pub fn outcome(&self, id: &TestcaseId) -> Option<ProcessOutcome> {
        self.lock().outcomes.get(id).cloned()
    }

    pub fn compile_outcome(&self) -> Option<ProcessOutcome> {
        self.lock().compile_outcome.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Discards the previous generation and re-seeds every testcase as
    /// `Waiting`. Subscribers are kept.
    pub fn reset(&self, generation: u64, ids: impl Iterator<Item = TestcaseId>) {
        let mut guard = self.lock();
        guard.state = RunState {
            generation,
            compile_status: CompileStatus::NotStarted,
            statuses: ids.map(|id| (id, TestcaseStatus::Waiting)).collect(),
        };
        guard.outcomes.clear();
        guard.compile_outcome = None;
    }

    pub fn set_compile_status(&self, status: CompileStatus, outcome: Option<ProcessOutcome>) {
        let mut guard = self.lock();
        guard.state.compile_status = status;
        if outcome.is_some() {
            guard.compile_outcome = outcome;
        }
    }

    pub fn transition(&self, id: &TestcaseId, new: TestcaseStatus) {
        let mut guard = self.lock();
        Self::transition_locked(&mut guard, id, new);
    }

    /// Records the outcome and the terminal transition atomically.
    pub fn finish(&self, id: &TestcaseId, status: TestcaseStatus, outcome: ProcessOutcome) {
        let mut guard = self.lock();
        guard.outcomes.insert(id.clone(), outcome);
        Self::transition_locked(&mut guard, id, status);
    }

    fn transition_locked(guard: &mut StateInner, id: &TestcaseId, new: TestcaseStatus) {
        let generation = guard.state.generation;
        let Some(slot) = guard.state.statuses.get_mut(id) else {
            panic!("unknown testcase id: {}", id);
        };
        let old = *slot;
        assert!(
            !old.is_terminal() && old != new,
            "invalid status transition on testcase {}: {} -> {}",
            id,
            old,
            new
        );
        *slot = new;
        let event = StatusChange {
            generation,
            id: id.clone(),
            old,
            new,
        };
        guard
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_are_emitted_in_transition_order() {
        let cell = StateCell::default();
        cell.reset(1, [TestcaseId::Num(1)].into_iter());
        let mut rx = cell.subscribe();

        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Running);
        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Passed);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.old, TestcaseStatus::Waiting);
        assert_eq!(first.new, TestcaseStatus::Running);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.old, TestcaseStatus::Running);
        assert_eq!(second.new, TestcaseStatus::Passed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "invalid status transition")]
    fn terminal_status_never_regresses() {
        let cell = StateCell::default();
        cell.reset(1, [TestcaseId::Num(1)].into_iter());
        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Running);
        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Passed);
        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Cancelled);
    }

    #[test]
    fn reset_supersedes_previous_generation() {
        let cell = StateCell::default();
        cell.reset(1, [TestcaseId::Num(1)].into_iter());
        cell.transition(&TestcaseId::Num(1), TestcaseStatus::Running);

        cell.reset(2, [TestcaseId::Num(1), TestcaseId::Num(2)].into_iter());
        let snap = cell.snapshot();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.statuses.len(), 2);
        assert!(snap
            .statuses
            .values()
            .all(|&st| st == TestcaseStatus::Waiting));
    }
}
