use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::watch,
    time::Instant,
};

/// How the child process came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    /// Terminated by a signal we did not send.
    Signaled(i32),
    TimedOut,
    Cancelled,
    SpawnError(String),
}

impl ExitKind {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SpawnError(msg) => write!(f, "spawn error: {}", msg),
        }
    }
}

/// Terminal record of one process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit: ExitKind,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
    pub wall_time: Duration,
}

impl ProcessOutcome {
    fn spawn_error(msg: String) -> Self {
        Self {
            exit: ExitKind::SpawnError(msg),
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
            wall_time: Duration::ZERO,
        }
    }
}

/// Cancellation signal shared by every process of one run generation.
pub type CancelSignal = watch::Receiver<bool>;

/// Sending side of the cancellation signal.
pub type CancelSource = Arc<watch::Sender<bool>>;

pub fn cancel_channel() -> (CancelSource, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Arc::new(tx), rx)
}

/// Executes one command through `<shell> -c`, feeding stdin and capturing
/// size-capped output under a wall-clock limit.
#[derive(Debug, Clone)]
pub struct ProcessSlot {
    shell: PathBuf,
    command: String,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    max_output: usize,
}

impl ProcessSlot {
    /// Grace between SIGTERM and SIGKILL on timeout/cancel.
    const KILL_GRACE: Duration = Duration::from_millis(500);
    /// Bound on draining pipes after the child is gone; a grandchild that
    /// inherited them must not stall the outcome.
    const DRAIN_GRACE: Duration = Duration::from_secs(2);

    pub fn new(shell: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            current_dir: None,
            timeout: None,
            max_output: usize::MAX,
        }
    }

    pub fn current_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.current_dir = dir;
        self
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    pub fn get_command(&self) -> &str {
        &self.command
    }

    /// Runs the command to completion. Never fails: spawn errors, timeout
    /// and cancellation are all encoded in the outcome.
    pub async fn execute(&self, input: &[u8], mut cancel: CancelSignal) -> ProcessOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", &self.command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::spawn_error(format!(
                    "Failed to spawn '{} -c {}': {}",
                    self.shell.to_string_lossy(),
                    self.command,
                    e
                ))
            }
        };
        let started = Instant::now();

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return ProcessOutcome::spawn_error("child stdio was not piped".to_owned());
        };

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let budget = Arc::new(AtomicUsize::new(self.max_output));
        let truncated = Arc::new(AtomicBool::new(false));

        let input = input.to_vec();
        let mut io = tokio::spawn({
            let stdout_buf = stdout_buf.clone();
            let stderr_buf = stderr_buf.clone();
            let budget = budget.clone();
            let truncated = truncated.clone();
            async move {
                let feed = async move {
                    let _ = stdin.write_all(&input).await;
                    let _ = stdin.shutdown().await;
                    drop(stdin); // close the pipe so the child sees EOF
                };
                tokio::join!(
                    feed,
                    read_capped(stdout, &stdout_buf, &budget, &truncated),
                    read_capped(stderr, &stderr_buf, &budget, &truncated),
                );
            }
        });

        let deadline = match self.timeout {
            Some(limit) => started + limit,
            None => far_future(),
        };

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => exit_kind(status),
                Err(e) => ExitKind::SpawnError(format!("Failed to wait for child: {}", e)),
            },
            _ = wait_cancelled(&mut cancel) => {
                self.shutdown(&mut child).await;
                ExitKind::Cancelled
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.shutdown(&mut child).await;
                ExitKind::TimedOut
            }
        };
        let wall_time = started.elapsed();

        if tokio::time::timeout(Self::DRAIN_GRACE, &mut io).await.is_err() {
            log::warn!("Output pipes still open after child exit; abandoning them");
            io.abort();
        }

        ProcessOutcome {
            exit,
            stdout: take_buf(&stdout_buf),
            stderr: take_buf(&stderr_buf),
            truncated: truncated.load(Ordering::Relaxed),
            wall_time,
        }
    }

    /// SIGTERM, a grace period, then SIGKILL.
    async fn shutdown(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(Self::KILL_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill child process: {:#}", e);
        }
    }
}

fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    match status.code() {
        Some(code) => ExitKind::Exited(code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            ExitKind::Signaled(status.signal().unwrap_or(0))
        }
    }
}

async fn wait_cancelled(cancel: &mut CancelSignal) {
    if cancel.wait_for(|&cancelled| cancelled).await.is_err() {
        // Sender gone: this execution can no longer be cancelled.
        std::future::pending::<()>().await;
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

fn take_buf(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Reads `src` to EOF, keeping at most what `budget` still allows and
/// discarding the rest so the child never blocks on a full pipe.
async fn read_capped<R>(
    mut src: R,
    buf: &Mutex<Vec<u8>>,
    budget: &AtomicUsize,
    truncated: &AtomicBool,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = match src.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Error reading child output: {}", e);
                return;
            }
        };
        let take = claim(budget, n);
        if take < n {
            truncated.store(true, Ordering::Relaxed);
        }
        if take > 0 {
            buf.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..take]);
        }
    }
}

fn claim(budget: &AtomicUsize, want: usize) -> usize {
    let mut current = budget.load(Ordering::Relaxed);
    loop {
        let take = want.min(current);
        match budget.compare_exchange_weak(
            current,
            current - take,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return take,
            Err(now) => current = now,
        }
    }
}
