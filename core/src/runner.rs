use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use tokio::sync::{mpsc, Mutex};

use crate::compare::ComparisonMode;
use crate::process::{cancel_channel, CancelSource, ExitKind, ProcessOutcome, ProcessSlot};
use crate::scheduler::{Scheduler, TestcaseTask};
use crate::state::{RunState, StateCell};
use crate::status::{CompileStatus, StatusChange, TestcaseStatus};
use crate::testcase::{TcTable, TestcaseId};

/// Resolved per-run settings. Commands are final strings executed through
/// `shell -c`; the caller has already expanded any templating.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub shell: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub compile_command: Option<String>,
    pub run_command: String,
    pub max_parallel_processes: usize,
    /// `None` means no wall-clock limit.
    pub timeout: Option<Duration>,
    /// Combined stdout+stderr capture cap, per process.
    pub max_output_size: usize,
    pub comparison: ComparisonMode,
}

impl RunConfig {
    pub const DEFAULT_SHELL: &'static str = "/bin/sh";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_MAX_PARALLEL: usize = 4;
    pub const DEFAULT_MAX_OUTPUT: usize = 1 << 20;

    pub fn new(run_command: impl Into<String>) -> Self {
        Self {
            shell: Self::DEFAULT_SHELL.into(),
            working_dir: None,
            compile_command: None,
            run_command: run_command.into(),
            max_parallel_processes: Self::DEFAULT_MAX_PARALLEL,
            timeout: Some(Self::DEFAULT_TIMEOUT),
            max_output_size: Self::DEFAULT_MAX_OUTPUT,
            comparison: ComparisonMode::Exact,
        }
    }

    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn compile_command(mut self, cmd: impl Into<String>) -> Self {
        self.compile_command = Some(cmd.into());
        self
    }

    pub fn max_parallel_processes(mut self, n: usize) -> Self {
        self.max_parallel_processes = n;
        self
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    pub fn comparison(mut self, mode: ComparisonMode) -> Self {
        self.comparison = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("run superseded by a newer run before it could start (generation {0})")]
    Superseded(u64),

    #[error("runner is closed")]
    Closed,

    #[error("duplicate testcase id: {0}")]
    DuplicateTestcaseId(TestcaseId),
}

/// Orchestrates one full run: optional compile step, then all testcases
/// through the scheduler. A new `run()` supersedes and tears down the
/// previous one; `kill_all()` cancels whatever is in flight.
pub struct Runner {
    cfg: RunConfig,
    state: Arc<StateCell>,
    generation: AtomicU64,
    cancel: StdMutex<Option<CancelSource>>,
    run_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Runner {
    pub fn new(cfg: RunConfig) -> Self {
        Self {
            cfg,
            state: Arc::new(StateCell::default()),
            generation: AtomicU64::new(0),
            cancel: StdMutex::new(None),
            run_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.cfg
    }

    /// Current aggregate state; cheap to call at any time.
    pub fn snapshot(&self) -> RunState {
        self.state.snapshot()
    }

    /// Incremental status-change feed. Events of a superseded generation
    /// are identifiable by their `generation` field.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusChange> {
        self.state.subscribe()
    }

    /// Final process details of one testcase, available once it finished.
    pub fn outcome(&self, id: &TestcaseId) -> Option<ProcessOutcome> {
        self.state.outcome(id)
    }

    pub fn compile_outcome(&self) -> Option<ProcessOutcome> {
        self.state.compile_outcome()
    }

    /// Executes the whole run and returns the final state snapshot. If a
    /// previous run is still active it is cancelled and fully torn down
    /// before this one starts.
    pub async fn run(&self, table: TcTable, compile: bool) -> Result<RunState, RunError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunError::Closed);
        }
        let mut seen = HashSet::new();
        for testcase in &table {
            if !seen.insert(&testcase.id) {
                return Err(RunError::DuplicateTestcaseId(testcase.id.clone()));
            }
        }

        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.signal_cancel();
        let _active = self.run_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != my_generation {
            return Err(RunError::Superseded(my_generation));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunError::Closed);
        }

        let (cancel, _) = cancel_channel();
        *self.lock_cancel() = Some(cancel.clone());
        self.state
            .reset(my_generation, table.iter().map(|t| t.id.clone()));

        if compile && self.cfg.compile_command.is_some() {
            if !self.run_compile_step(&cancel).await {
                for testcase in &table {
                    self.state.transition(&testcase.id, TestcaseStatus::Cancelled);
                }
                return Ok(self.state.snapshot());
            }
        }

        let tasks: Vec<TestcaseTask> = table
            .into_iter()
            .map(|testcase| {
                let slot = ProcessSlot::new(&self.cfg.shell, &self.cfg.run_command)
                    .current_dir(self.cfg.working_dir.clone())
                    .timeout(self.cfg.timeout)
                    .max_output(self.cfg.max_output_size);
                TestcaseTask::new(testcase, slot, self.cfg.comparison, self.state.clone())
            })
            .collect();

        log::info!(
            "Running {} testcase(s): {}",
            tasks.len(),
            self.cfg.run_command
        );
        Scheduler::schedule(tasks, self.cfg.max_parallel_processes, cancel)
            .wait()
            .await;
        Ok(self.state.snapshot())
    }

    /// Returns true when compilation succeeded.
    async fn run_compile_step(&self, cancel: &CancelSource) -> bool {
        let Some(cmd) = &self.cfg.compile_command else {
            return true;
        };
        log::info!("Compiling: {}", cmd);
        self.state.set_compile_status(CompileStatus::Running, None);

        // No wall-clock limit for the compiler; it stays cancellable.
        let slot = ProcessSlot::new(&self.cfg.shell, cmd)
            .current_dir(self.cfg.working_dir.clone())
            .max_output(self.cfg.max_output_size);
        let outcome = slot.execute(b"", cancel.subscribe()).await;

        if outcome.exit.success() {
            self.state
                .set_compile_status(CompileStatus::Succeeded, Some(outcome));
            true
        } else {
            let detail = compile_failure_detail(&outcome);
            log::warn!("Compile failed: {}", detail);
            self.state
                .set_compile_status(CompileStatus::Failed(detail), Some(outcome));
            false
        }
    }

    /// Cancels the compile step or every in-flight testcase process and
    /// returns once all of them have exited. Safe to call when idle.
    pub async fn kill_all(&self) {
        self.signal_cancel();
        let _teardown = self.run_lock.lock().await;
    }

    /// Explicit disposal: kills everything and rejects further runs.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.kill_all().await;
    }

    fn signal_cancel(&self) {
        if let Some(cancel) = self.lock_cancel().as_ref() {
            // send_replace: the flag must stick even before the first
            // process has subscribed
            cancel.send_replace(true);
        }
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<Option<CancelSource>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn compile_failure_detail(outcome: &ProcessOutcome) -> String {
    let mut detail = match &outcome.exit {
        ExitKind::Exited(code) => format!("compile command exited with code {}", code),
        ExitKind::Signaled(sig) => format!("compile command killed by signal {}", sig),
        ExitKind::TimedOut => "compile command timed out".to_owned(),
        ExitKind::Cancelled => "compile cancelled".to_owned(),
        ExitKind::SpawnError(msg) => msg.clone(),
    };
    if !outcome.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&outcome.stderr);
        if let Some(first_line) = stderr.lines().next() {
            detail.push_str(": ");
            detail.push_str(first_line);
        }
    }
    detail
}
