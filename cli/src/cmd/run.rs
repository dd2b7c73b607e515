use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context as _};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tcrun_core::{
    CompileStatus, RunState, Runner, StatusChange, TestcaseId, TestcaseStatus,
};

use crate::config::{Config, TestCommand};
use crate::interp;
use crate::loader;
use crate::style;
use crate::util;

use super::{GlobalArgs, SubcmdResult};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Solution source file to compile and run
    #[arg()] // positional argument
    pub program_file: PathBuf,

    #[arg(short = 'd', long)]
    pub testcase_dir: Option<PathBuf>,

    /// Skip the compile step even when one is configured
    #[arg(long)]
    pub no_compile: bool,

    /// Override test.max_parallel_processes
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Emit a JSON report instead of styled output
    #[arg(long)]
    pub json: bool,
}

pub async fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let cfg = Config::from_file_finding_in_ancestors(util::current_dir())?;
    ensure!(
        args.program_file.is_file(),
        "No such file: {:?}",
        args.program_file
    );
    let filename = args
        .program_file
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .context("Program path has no filename")?;

    let cmd = cfg.test.find_test_cmd_for_filename(&filename).with_context(|| {
        format!(
            "Unconfigured test command for filename '{}' (no entry matched a glob in `test.command[]`)",
            filename
        )
    })?;
    let vars = interp::program_file_vars(&args.program_file);
    let cmd = TestCommand {
        compile: cmd
            .compile
            .as_deref()
            .map(|c| interp::expand(c, &vars))
            .transpose()?,
        run: interp::expand(&cmd.run, &vars)?,
    };

    let testcase_dir = args.testcase_dir.clone().unwrap_or_else(|| {
        args.program_file
            .parent()
            .unwrap_or(Path::new("."))
            .join("tests")
    });
    log::info!("Loading testcases from {:?}", testcase_dir);
    let table = loader::load_testcase_dir(&testcase_dir)?;
    ensure!(!table.is_empty(), "No testcases found in {:?}", testcase_dir);

    let mut run_cfg = cfg.test.to_run_config(cmd);
    if let Some(jobs) = args.jobs {
        run_cfg.max_parallel_processes = jobs;
    }
    ensure!(
        run_cfg.max_parallel_processes >= 1,
        "max_parallel_processes must be at least 1"
    );
    let want_compile = cfg.test.compile_before_run && !args.no_compile;

    let expected: HashMap<TestcaseId, Option<Vec<u8>>> = table
        .iter()
        .map(|t| (t.id.clone(), t.expected.clone()))
        .collect();
    let total = table.len();

    let runner = Arc::new(Runner::new(run_cfg));

    // first Ctrl-C kills every in-flight process
    tokio::spawn({
        let runner = runner.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                runner.kill_all().await;
            }
        }
    });

    let ui = if args.json {
        None
    } else {
        let progress = MultiProgress::new();
        let spinner_style = ProgressStyle::default_spinner().template("{spinner} {msg}")?;
        let mut bars = HashMap::new();
        for testcase in &table {
            let bar = progress
                .add(ProgressBar::new_spinner())
                .with_style(spinner_style.clone())
                .with_message(format!("Testcase {} ...", testcase.id));
            bar.enable_steady_tick(Duration::from_millis(80));
            bars.insert(testcase.id.clone(), bar);
        }
        Some(tokio::spawn(drive_progress(
            runner.clone(),
            runner.subscribe(),
            bars,
            total,
        )))
    };

    let state = runner.run(table, want_compile).await?;
    if let Some(ui) = ui {
        let _ = ui.await;
    }

    if args.json {
        print_json_report(&runner, &state)?;
    } else if let CompileStatus::Failed(detail) = &state.compile_status {
        if let Some(outcome) = runner.compile_outcome() {
            eprint!("{}", String::from_utf8_lossy(&outcome.stderr));
        }
        bail!("Compile failed: {}", detail);
    } else {
        for (id, &status) in &state.statuses {
            if status.is_terminal()
                && !status.is_passed()
                && status != TestcaseStatus::Cancelled
            {
                if let Some(outcome) = runner.outcome(id) {
                    style::print_testcase_detail(
                        id,
                        status,
                        expected.get(id).and_then(|e| e.as_deref()),
                        &outcome,
                    );
                }
            }
        }
        println!();
        style::print_summary(&state);
    }

    let all_passed = matches!(state.compile_status, CompileStatus::NotStarted | CompileStatus::Succeeded)
        && state.statuses.values().all(|st| st.is_passed());
    if !all_passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn drive_progress(
    runner: Arc<Runner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<StatusChange>,
    bars: HashMap<TestcaseId, ProgressBar>,
    total: usize,
) {
    let mut finished = 0;
    while let Some(ev) = events.recv().await {
        let Some(bar) = bars.get(&ev.id) else {
            continue;
        };
        if ev.new == TestcaseStatus::Running {
            bar.set_message(format!("Testcase {} running", ev.id));
        } else if ev.new.is_terminal() {
            let millis = runner
                .outcome(&ev.id)
                .map(|o| o.wall_time.as_millis())
                .unwrap_or(0);
            bar.finish_with_message(format!(
                "Testcase {} {} [{}ms]",
                ev.id,
                style::status_icon(ev.new),
                millis
            ));
            finished += 1;
            if finished == total {
                return;
            }
        }
    }
}

#[derive(serde::Serialize)]
struct Report {
    generation: u64,
    compile_status: String,
    testcases: Vec<CaseReport>,
}

#[derive(serde::Serialize)]
struct CaseReport {
    id: String,
    status: String,
    exit: Option<String>,
    wall_time_ms: Option<u128>,
    stdout: Option<String>,
    stderr: Option<String>,
    truncated: Option<bool>,
}

fn print_json_report(runner: &Runner, state: &RunState) -> anyhow::Result<()> {
    let testcases = state
        .statuses
        .iter()
        .map(|(id, status)| {
            let outcome = runner.outcome(id);
            CaseReport {
                id: id.to_string(),
                status: status.to_string(),
                exit: outcome.as_ref().map(|o| o.exit.to_string()),
                wall_time_ms: outcome.as_ref().map(|o| o.wall_time.as_millis()),
                stdout: outcome
                    .as_ref()
                    .map(|o| String::from_utf8_lossy(&o.stdout).into_owned()),
                stderr: outcome
                    .as_ref()
                    .map(|o| String::from_utf8_lossy(&o.stderr).into_owned()),
                truncated: outcome.as_ref().map(|o| o.truncated),
            }
        })
        .collect();
    let report = Report {
        generation: state.generation,
        compile_status: match &state.compile_status {
            CompileStatus::NotStarted => "not-started".to_owned(),
            CompileStatus::Running => "running".to_owned(),
            CompileStatus::Succeeded => "succeeded".to_owned(),
            CompileStatus::Failed(detail) => format!("failed: {}", detail),
        },
        testcases,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
